//! Rebasing a batch of steps over concurrent changes.
//!
//! Each step is moved back to the batch's base version by the inverses of
//! the steps before it, forward over the concurrent changes, then forward
//! again over the already-rebased earlier steps:
//!
//! ```text
//!   step i  ──inv(s_{i-1})…inv(s_0)──►  base  ──over…──►  head  ──s_0'…s_{i-1}'──►  result
//! ```
//!
//! Every rebased step is registered as the mirror of its own inverse, so a
//! position inside content the batch itself inserted survives the round trip
//! instead of collapsing onto the deletion edge.

use crate::mapping::{Mapping, StepMap};
use crate::step::Step;

/// Output of a rebase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rebased {
    /// Steps that survived, in their original order.
    pub steps: Vec<Step>,
    /// Indices (into the input) of steps whose target was deleted.
    pub dropped: Vec<usize>,
}

/// Rebases `steps` (authored against some base) over `over` (applied to the
/// same base first).
pub fn rebase_steps(steps: &[Step], over: &[Step]) -> Rebased {
    let over: Vec<StepMap> = over.iter().map(Step::get_map).collect();
    rebase_over_maps(&[], steps, &over)
}

/// Like [`rebase_steps`], but `steps` are authored after `undo`, which is
/// first taken back out. Used to move one commit out of a longer history.
pub fn rebase_steps_after(undo: &[Step], steps: &[Step], over: &[Step]) -> Rebased {
    let undo: Vec<StepMap> = undo.iter().map(Step::get_map).collect();
    let over: Vec<StepMap> = over.iter().map(Step::get_map).collect();
    rebase_over_maps(&undo, steps, &over)
}

/// Rebases over raw position maps.
pub fn rebase_over_maps(undo: &[StepMap], steps: &[Step], over: &[StepMap]) -> Rebased {
    let mut mapping = Mapping::new();
    for step in steps.iter().rev() {
        mapping.append_map(step.get_map().invert(), None);
    }
    for map in undo.iter().rev() {
        mapping.append_map(map.invert(), None);
    }
    for map in over {
        mapping.append_map(map.clone(), None);
    }

    let mut result = Rebased::default();
    let mut map_from = steps.len();
    for (i, step) in steps.iter().enumerate() {
        let mapped = step.map(&mapping.slice(map_from));
        map_from -= 1;
        match mapped {
            Some(mapped) => {
                mapping.append_map(mapped.get_map(), Some(map_from));
                result.steps.push(mapped);
            }
            None => {
                log::debug!("rebase dropped step {i} ({step}): target deleted");
                result.dropped.push(i);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockKind, Document, Mark};
    use crate::step::apply_all;

    #[test]
    fn test_rebase_over_nothing_is_identity() {
        let steps = vec![Step::insert_text(1, "ab"), Step::insert_text(3, "cd")];
        let rebased = rebase_steps(&steps, &[]);
        assert_eq!(rebased.steps, steps);
        assert!(rebased.dropped.is_empty());
    }

    #[test]
    fn test_typing_run_keeps_relative_positions() {
        // Local: type "abc" one char at a time at the start of "xyz".
        let base = Document::from_paragraphs(&["xyz"]);
        let local = vec![
            Step::insert_text(1, "a"),
            Step::insert_text(2, "b"),
            Step::insert_text(3, "c"),
        ];
        // Remote: append "!" at the end.
        let remote = vec![Step::insert_text(4, "!")];
        let rebased = rebase_steps(&local, &remote);

        let head = apply_all(&base, &remote).unwrap();
        let result = apply_all(&head, &rebased.steps).unwrap();
        assert_eq!(result.text_content(), "abcxyz!");
    }

    #[test]
    fn test_rebase_over_remote_prefix_insert() {
        let base = Document::from_paragraphs(&["world"]);
        let local = vec![
            Step::insert_text(6, "!"),
            Step::AddMark {
                from: 1,
                to: 7,
                mark: Mark::Em,
            },
        ];
        let remote = vec![Step::insert_text(1, "hello ")];
        let rebased = rebase_steps(&local, &remote);

        let head = apply_all(&base, &remote).unwrap();
        let result = apply_all(&head, &rebased.steps).unwrap();
        assert_eq!(result.text_content(), "hello world!");
        let em: String = result.blocks()[0]
            .content
            .iter()
            .filter(|r| r.marks.contains(&Mark::Em))
            .map(|r| r.text.as_str())
            .collect();
        assert_eq!(em, "world!");
    }

    #[test]
    fn test_step_targeting_deleted_text_is_dropped() {
        let local = vec![
            Step::AddMark { from: 2, to: 4, mark: Mark::Strong },
            Step::insert_text(1, "z"),
        ];
        let remote = vec![Step::delete(1, 6)];
        let rebased = rebase_steps(&local, &remote);
        assert_eq!(rebased.dropped, vec![0]);
        assert_eq!(rebased.steps, vec![Step::insert_text(1, "z")]);
    }

    #[test]
    fn test_rebase_after_undo() {
        // History on a fork of "ab": commit 1 splits, commit 2 types into the
        // second block. Only commit 2 is moved onto the parent.
        let base = Document::from_paragraphs(&["ab"]);
        let commit1 = vec![Step::Split { pos: 2, kind: BlockKind::Paragraph }];
        let commit2 = vec![Step::insert_text(5, "!")];
        let parent = vec![Step::insert_text(1, ">")];

        let rebased = rebase_steps_after(&commit1, &commit2, &parent);
        let head = apply_all(&base, &parent).unwrap();
        let result = apply_all(&head, &rebased.steps).unwrap();
        assert_eq!(result.text_content(), ">ab!");
    }
}

//! Algebraic properties of steps, maps and rebase.

use proptest::prelude::*;

use quire_core::{
    apply_all, rebase_steps, Assoc, Block, BlockKind, Document, Mapping, Mark, Slice, Step,
    StepMap,
};

fn arb_map() -> impl Strategy<Value = StepMap> {
    (0usize..40, 0usize..8, 0usize..8).prop_map(|(s, o, n)| StepMap::single(s, o, n))
}

fn arb_insert_map() -> impl Strategy<Value = StepMap> {
    (0usize..40, 1usize..8).prop_map(|(s, n)| StepMap::single(s, 0, n))
}

fn arb_doc() -> impl Strategy<Value = Document> {
    prop::collection::vec("[a-z]{0,6}", 1..4).prop_map(|texts| {
        let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
        Document::from_paragraphs(&texts)
    })
}

fn arb_step() -> impl Strategy<Value = Step> {
    (0usize..7, 0usize..24, 0usize..24, "[a-z]{0,3}").prop_map(|(kind, a, b, text)| {
        let (from, to) = (a.min(b), a.max(b));
        match kind {
            0 => Step::replace_text(from, to, &text),
            1 => Step::AddMark { from, to, mark: Mark::Strong },
            2 => Step::RemoveMark { from, to, mark: Mark::Strong },
            3 => Step::Split { pos: a, kind: BlockKind::Heading { level: 1 } },
            4 => Step::Join { pos: a },
            5 => Step::SetBlockType { pos: a, kind: BlockKind::Blockquote },
            _ => Step::Replace {
                from,
                to,
                slice: Slice::Blocks(vec![Block::paragraph(&text)]),
            },
        }
    })
}

fn arb_inline_edit() -> impl Strategy<Value = (usize, usize, String)> {
    (0usize..=4, 0usize..=4, "[a-z]{0,2}")
}

fn inline_step((a, b, text): &(usize, usize, String)) -> Step {
    Step::replace_text(1 + a.min(b), 1 + a.max(b), text)
}

proptest! {
    #[test]
    fn prop_mapping_composition_is_associative(
        a in arb_map(),
        b in arb_map(),
        c in arb_map(),
        pos in 0usize..60,
    ) {
        let mut left = Mapping::from_maps([a.clone(), b.clone()]);
        left.append_mapping(&Mapping::from_maps([c.clone()]));
        let mut right = Mapping::from_maps([a.clone()]);
        right.append_mapping(&Mapping::from_maps([b.clone(), c.clone()]));

        for assoc in [Assoc::Before, Assoc::After] {
            let stepwise = c.map(b.map(a.map(pos, assoc), assoc), assoc);
            prop_assert_eq!(left.map(pos, assoc), stepwise);
            prop_assert_eq!(right.map(pos, assoc), stepwise);
        }
    }

    #[test]
    fn prop_step_mapping_composes(
        a in arb_insert_map(),
        b in arb_insert_map(),
        x in 0usize..40,
        y in 0usize..40,
    ) {
        let step = Step::replace_text(x.min(y), x.max(y), "q");
        let composed = step.map(&Mapping::from_maps([a.clone(), b.clone()]));
        let stepwise = step
            .map(&Mapping::from_maps([a]))
            .and_then(|s| s.map(&Mapping::from_maps([b])));
        prop_assert_eq!(composed, stepwise);
    }

    #[test]
    fn prop_insertions_invert_exactly(
        maps in prop::collection::vec(arb_insert_map(), 1..5),
        pos in 0usize..60,
    ) {
        let mapping = Mapping::from_maps(maps);
        let inverse = mapping.invert();
        for assoc in [Assoc::Before, Assoc::After] {
            prop_assert_eq!(inverse.map(mapping.map(pos, assoc), assoc), pos);
        }
    }

    #[test]
    fn prop_invert_restores_document(doc in arb_doc(), step in arb_step()) {
        let Ok(post) = step.apply(&doc) else {
            return Ok(());
        };
        let undo = step.invert(&doc).expect("a step that applied can be inverted");
        prop_assert_eq!(undo.apply(&post).expect("undo applies"), doc);
    }

    #[test]
    fn prop_rebased_inline_edits_apply(
        text in "[a-z]{4,10}",
        local in prop::collection::vec(arb_inline_edit(), 1..4),
        remote in prop::collection::vec(arb_inline_edit(), 1..4),
    ) {
        // Edits stay within the first four chars so every batch applies
        // sequentially to the base paragraph.
        let base = Document::from_paragraphs(&[text.as_str()]);
        let local: Vec<Step> = local.iter().map(inline_step).collect();
        let remote: Vec<Step> = remote.iter().map(inline_step).collect();
        prop_assume!(apply_all(&base, &local).is_ok());
        let head = apply_all(&base, &remote);
        prop_assume!(head.is_ok());

        let rebased = rebase_steps(&local, &remote);
        prop_assert!(apply_all(&head.unwrap(), &rebased.steps).is_ok());
    }
}

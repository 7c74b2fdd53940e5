//! Atomic, invertible document edits.
//!
//! A step is applied against one exact document version. When positions or
//! block types no longer line up, `apply` fails with [`InvalidStepError`]
//! instead of guessing; the sync engine uses that failure to isolate
//! corrupt steps.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::InvalidStepError;
use crate::mapping::{Assoc, Mapping, StepMap};
use crate::model::{
    mark_coverage, replace_runs, slice_runs, split_runs, update_marks, Block, BlockKind,
    Document, Mark, ResolvedPos, Slice, TextRun,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    /// Replace `from..to` with `slice`. Inline slices stay inside one block,
    /// block slices run between block boundaries.
    Replace { from: usize, to: usize, slice: Slice },
    AddMark { from: usize, to: usize, mark: Mark },
    RemoveMark { from: usize, to: usize, mark: Mark },
    /// Split the block at content position `pos`; the second half becomes `kind`.
    Split { pos: usize, kind: BlockKind },
    /// Join the two blocks meeting at boundary `pos`.
    Join { pos: usize },
    /// Change the kind of the block whose opening token is at `pos`.
    SetBlockType { pos: usize, kind: BlockKind },
}

impl Step {
    pub fn insert_text(pos: usize, text: &str) -> Self {
        Step::Replace {
            from: pos,
            to: pos,
            slice: Slice::text(text),
        }
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Step::Replace {
            from,
            to,
            slice: Slice::empty(),
        }
    }

    pub fn replace_text(from: usize, to: usize, text: &str) -> Self {
        Step::Replace {
            from,
            to,
            slice: Slice::text(text),
        }
    }

    pub fn apply(&self, doc: &Document) -> Result<Document, InvalidStepError> {
        match self {
            Step::Replace { from, to, slice } => apply_replace(doc, *from, *to, slice),
            Step::AddMark { from, to, mark } => {
                let (index, a, b) = inline_range(doc, *from, *to)?;
                let block = &doc.blocks()[index];
                if !block.kind.allows_marks() {
                    return Err(InvalidStepError::MarkNotAllowed {
                        mark: mark.to_string(),
                        kind: block.kind.to_string(),
                    });
                }
                let content = update_marks(&block.content, a, b, |marks| {
                    marks.insert(mark.clone());
                });
                replace_block_content(doc, index, content)
            }
            Step::RemoveMark { from, to, mark } => {
                let (index, a, b) = inline_range(doc, *from, *to)?;
                let content = update_marks(&doc.blocks()[index].content, a, b, |marks| {
                    marks.remove(mark);
                });
                replace_block_content(doc, index, content)
            }
            Step::Split { pos, kind } => {
                kind.validate()?;
                let (index, offset) = match doc.resolve(*pos)? {
                    ResolvedPos::Inside { index, offset } => (index, offset),
                    ResolvedPos::Boundary { .. } => {
                        return Err(InvalidStepError::NotInContent { pos: *pos })
                    }
                };
                let (left, right) = split_runs(&doc.blocks()[index].content, offset);
                let second = Block::new(kind.clone(), right);
                second.validate()?;
                let mut blocks = doc.blocks().to_vec();
                blocks[index] = Block::new(blocks[index].kind.clone(), left);
                blocks.insert(index + 1, second);
                Document::with_blocks(blocks)
            }
            Step::Join { pos } => {
                let index = join_index(doc, *pos)?;
                let mut blocks = doc.blocks().to_vec();
                let second = blocks.remove(index);
                let first = &blocks[index - 1];
                let mut content = first.content.clone();
                content.extend(second.content);
                let merged = Block::new(first.kind.clone(), content);
                merged.validate()?;
                blocks[index - 1] = merged;
                Document::with_blocks(blocks)
            }
            Step::SetBlockType { pos, kind } => {
                let index = block_index_at(doc, *pos)?;
                let mut blocks = doc.blocks().to_vec();
                let changed = Block::new(kind.clone(), blocks[index].content.clone());
                changed.validate()?;
                blocks[index] = changed;
                Document::with_blocks(blocks)
            }
        }
    }

    /// The step that undoes `self` when applied to the document `self`
    /// produced from `pre`.
    pub fn invert(&self, pre: &Document) -> Result<Step, InvalidStepError> {
        match self {
            Step::Replace { from, to, slice } => {
                let original = match slice {
                    Slice::Inline(_) => {
                        let (index, a, b) = inline_range(pre, *from, *to)?;
                        Slice::Inline(slice_runs(&pre.blocks()[index].content, a, b))
                    }
                    Slice::Blocks(_) => {
                        let (i, j) = boundary_range(pre, *from, *to)?;
                        Slice::Blocks(pre.blocks()[i..j].to_vec())
                    }
                };
                Ok(Step::Replace {
                    from: *from,
                    to: from + slice.size(),
                    slice: original,
                })
            }
            Step::AddMark { from, to, mark } => {
                let (index, a, b) = inline_range(pre, *from, *to)?;
                let runs = &pre.blocks()[index].content;
                let (any, _) = mark_coverage(runs, a, b, mark);
                if any {
                    Ok(restore_runs(*from, *to, slice_runs(runs, a, b)))
                } else {
                    Ok(Step::RemoveMark {
                        from: *from,
                        to: *to,
                        mark: mark.clone(),
                    })
                }
            }
            Step::RemoveMark { from, to, mark } => {
                let (index, a, b) = inline_range(pre, *from, *to)?;
                let runs = &pre.blocks()[index].content;
                let (_, all) = mark_coverage(runs, a, b, mark);
                if all {
                    Ok(Step::AddMark {
                        from: *from,
                        to: *to,
                        mark: mark.clone(),
                    })
                } else {
                    Ok(restore_runs(*from, *to, slice_runs(runs, a, b)))
                }
            }
            Step::Split { pos, .. } => Ok(Step::Join { pos: pos + 1 }),
            Step::Join { pos } => {
                let index = join_index(pre, *pos)?;
                Ok(Step::Split {
                    pos: pos - 1,
                    kind: pre.blocks()[index].kind.clone(),
                })
            }
            Step::SetBlockType { pos, .. } => {
                let index = block_index_at(pre, *pos)?;
                Ok(Step::SetBlockType {
                    pos: *pos,
                    kind: pre.blocks()[index].kind.clone(),
                })
            }
        }
    }

    /// How this step moves positions.
    pub fn get_map(&self) -> StepMap {
        match self {
            Step::Replace { from, to, slice } => {
                StepMap::single(*from, to.saturating_sub(*from), slice.size())
            }
            Step::Split { pos, .. } => StepMap::single(*pos, 0, 2),
            Step::Join { pos } => StepMap::single(pos.saturating_sub(1), 2, 0),
            Step::AddMark { .. } | Step::RemoveMark { .. } | Step::SetBlockType { .. } => {
                StepMap::empty()
            }
        }
    }

    /// Re-expresses this step after the changes in `mapping`. Returns `None`
    /// when the content the step targets was deleted.
    pub fn map(&self, mapping: &Mapping) -> Option<Step> {
        match self {
            Step::Replace { from, to, slice } => {
                let from = mapping.map_result(*from, Assoc::After);
                let to = mapping.map_result(*to, Assoc::Before);
                if from.deleted_across() && to.deleted_across() {
                    return None;
                }
                Some(Step::Replace {
                    from: from.pos,
                    to: from.pos.max(to.pos),
                    slice: slice.clone(),
                })
            }
            Step::AddMark { from, to, mark } | Step::RemoveMark { from, to, mark } => {
                let from = mapping.map_result(*from, Assoc::After);
                let to = mapping.map_result(*to, Assoc::Before);
                if (from.deleted() && to.deleted()) || from.pos >= to.pos {
                    return None;
                }
                let (from, to, mark) = (from.pos, to.pos, mark.clone());
                Some(match self {
                    Step::AddMark { .. } => Step::AddMark { from, to, mark },
                    _ => Step::RemoveMark { from, to, mark },
                })
            }
            Step::Split { pos, kind } => {
                let pos = mapping.map_result(*pos, Assoc::After);
                (!pos.deleted_across()).then(|| Step::Split {
                    pos: pos.pos,
                    kind: kind.clone(),
                })
            }
            Step::Join { pos } => {
                let pos = mapping.map_result(*pos, Assoc::Before);
                (!pos.deleted_before() && !pos.deleted_after())
                    .then_some(Step::Join { pos: pos.pos })
            }
            Step::SetBlockType { pos, kind } => {
                let pos = mapping.map_result(*pos, Assoc::After);
                (!pos.deleted_after()).then(|| Step::SetBlockType {
                    pos: pos.pos,
                    kind: kind.clone(),
                })
            }
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Replace { from, to, slice } => {
                write!(f, "replace({from}..{to}, +{})", slice.size())
            }
            Step::AddMark { from, to, mark } => write!(f, "add_mark({from}..{to}, {mark})"),
            Step::RemoveMark { from, to, mark } => {
                write!(f, "remove_mark({from}..{to}, {mark})")
            }
            Step::Split { pos, kind } => write!(f, "split({pos}, {kind})"),
            Step::Join { pos } => write!(f, "join({pos})"),
            Step::SetBlockType { pos, kind } => write!(f, "set_block_type({pos}, {kind})"),
        }
    }
}

/// Applies steps in order, stopping at the first invalid one.
pub fn apply_all(doc: &Document, steps: &[Step]) -> Result<Document, InvalidStepError> {
    let mut current = doc.clone();
    for step in steps {
        current = step.apply(&current)?;
    }
    Ok(current)
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn restore_runs(from: usize, to: usize, runs: Vec<TextRun>) -> Step {
    Step::Replace {
        from,
        to,
        slice: Slice::Inline(runs),
    }
}

/// Resolves an inline range to `(block index, from offset, to offset)`.
fn inline_range(
    doc: &Document,
    from: usize,
    to: usize,
) -> Result<(usize, usize, usize), InvalidStepError> {
    if from > to {
        return Err(InvalidStepError::InvertedRange { from, to });
    }
    match (doc.resolve(from)?, doc.resolve(to)?) {
        (
            ResolvedPos::Inside { index: a, offset: x },
            ResolvedPos::Inside { index: b, offset: y },
        ) => {
            if a == b {
                Ok((a, x, y))
            } else {
                Err(InvalidStepError::CrossesBlocks { from, to })
            }
        }
        (ResolvedPos::Boundary { .. }, _) => Err(InvalidStepError::NotInContent { pos: from }),
        (_, ResolvedPos::Boundary { .. }) => Err(InvalidStepError::NotInContent { pos: to }),
    }
}

/// Resolves a range between block boundaries to block indices `i..j`.
fn boundary_range(
    doc: &Document,
    from: usize,
    to: usize,
) -> Result<(usize, usize), InvalidStepError> {
    if from > to {
        return Err(InvalidStepError::InvertedRange { from, to });
    }
    match (doc.resolve(from)?, doc.resolve(to)?) {
        (ResolvedPos::Boundary { index: i }, ResolvedPos::Boundary { index: j }) => Ok((i, j)),
        (ResolvedPos::Inside { .. }, _) => Err(InvalidStepError::NotABoundary { pos: from }),
        (_, ResolvedPos::Inside { .. }) => Err(InvalidStepError::NotABoundary { pos: to }),
    }
}

fn apply_replace(
    doc: &Document,
    from: usize,
    to: usize,
    slice: &Slice,
) -> Result<Document, InvalidStepError> {
    match slice {
        Slice::Inline(runs) => {
            let (index, a, b) = inline_range(doc, from, to)?;
            let block = &doc.blocks()[index];
            if !block.kind.allows_marks() {
                if let Some(mark) = runs.iter().flat_map(|r| r.marks.iter()).next() {
                    return Err(InvalidStepError::MarkNotAllowed {
                        mark: mark.to_string(),
                        kind: block.kind.to_string(),
                    });
                }
            }
            let content = replace_runs(&block.content, a, b, runs);
            replace_block_content(doc, index, content)
        }
        Slice::Blocks(inserted) => {
            let (i, j) = boundary_range(doc, from, to)?;
            let inserted: Vec<Block> = inserted
                .iter()
                .map(|b| Block::new(b.kind.clone(), b.content.clone()))
                .collect();
            for block in &inserted {
                block.validate()?;
            }
            let mut blocks = doc.blocks().to_vec();
            blocks.splice(i..j, inserted);
            Document::with_blocks(blocks)
        }
    }
}

fn replace_block_content(
    doc: &Document,
    index: usize,
    content: Vec<TextRun>,
) -> Result<Document, InvalidStepError> {
    let mut blocks = doc.blocks().to_vec();
    blocks[index].content = content;
    Document::with_blocks(blocks)
}

/// Index of the second block at a joinable boundary.
fn join_index(doc: &Document, pos: usize) -> Result<usize, InvalidStepError> {
    match doc.resolve(pos)? {
        ResolvedPos::Boundary { index } if index > 0 && index < doc.blocks().len() => Ok(index),
        ResolvedPos::Boundary { .. } => Err(InvalidStepError::NothingToJoin { pos }),
        ResolvedPos::Inside { .. } => Err(InvalidStepError::NotABoundary { pos }),
    }
}

/// Index of the block whose opening token sits at `pos`.
fn block_index_at(doc: &Document, pos: usize) -> Result<usize, InvalidStepError> {
    match doc.resolve(pos)? {
        ResolvedPos::Boundary { index } if index < doc.blocks().len() => Ok(index),
        _ => Err(InvalidStepError::NotABoundary { pos }),
    }
}

//! Reference document model: typed text blocks with marked inline runs.
//!
//! Positions are flat integers in the ProseMirror style. Every block
//! contributes an opening token, its text length in `char`s, and a closing
//! token:
//!
//! ```text
//!   0   1 2 3 4 5 6  7   8 9 10 11
//!   │<p>│ h e l l o │</p>│<h1>│ h i │</h1>│
//!   └───────────────┘    └──────────┘
//!     block 0 (7)          block 1 (4)       size() = 11
//! ```
//!
//! Position 0 sits before the first block and `size()` after the last.
//! Positions strictly between a block's tokens address its text content;
//! positions between blocks are boundaries.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::InvalidStepError;

// ─── Marks & block kinds ────────────────────────────────────────────────────

/// Inline formatting applied to a run of text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Mark {
    Strong,
    Em,
    Code,
    Link { href: String },
}

impl Mark {
    pub fn name(&self) -> &'static str {
        match self {
            Mark::Strong => "strong",
            Mark::Em => "em",
            Mark::Code => "code",
            Mark::Link { .. } => "link",
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The type of a top-level block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Paragraph,
    Heading { level: u8 },
    CodeBlock,
    Blockquote,
}

impl BlockKind {
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::Heading { .. } => "heading",
            BlockKind::CodeBlock => "code_block",
            BlockKind::Blockquote => "blockquote",
        }
    }

    /// Code blocks hold plain text only.
    pub fn allows_marks(&self) -> bool {
        !matches!(self, BlockKind::CodeBlock)
    }

    pub fn validate(&self) -> Result<(), InvalidStepError> {
        match self {
            BlockKind::Heading { level } if !(1..=6).contains(level) => Err(
                InvalidStepError::InvalidBlockType(format!("heading level {level}")),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Inline content ─────────────────────────────────────────────────────────

/// A run of text sharing one set of marks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    pub marks: BTreeSet<Mark>,
}

impl TextRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            marks: BTreeSet::new(),
        }
    }

    pub fn marked(text: impl Into<String>, marks: impl IntoIterator<Item = Mark>) -> Self {
        Self {
            text: text.into(),
            marks: marks.into_iter().collect(),
        }
    }

    /// Length in `char`s, which is the unit of flat positions.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Drops empty runs and merges neighbours with identical marks.
pub(crate) fn normalize_runs(runs: Vec<TextRun>) -> Vec<TextRun> {
    let mut out: Vec<TextRun> = Vec::with_capacity(runs.len());
    for run in runs {
        if run.text.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.marks == run.marks => last.text.push_str(&run.text),
            _ => out.push(run),
        }
    }
    out
}

pub(crate) fn runs_len(runs: &[TextRun]) -> usize {
    runs.iter().map(TextRun::len).sum()
}

fn byte_index(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

/// Splits runs at a char offset.
pub(crate) fn split_runs(runs: &[TextRun], at: usize) -> (Vec<TextRun>, Vec<TextRun>) {
    let mut left = Vec::new();
    let mut right = Vec::new();
    let mut offset = 0;
    for run in runs {
        let len = run.len();
        if offset + len <= at {
            left.push(run.clone());
        } else if offset >= at {
            right.push(run.clone());
        } else {
            let cut = byte_index(&run.text, at - offset);
            left.push(TextRun {
                text: run.text[..cut].to_string(),
                marks: run.marks.clone(),
            });
            right.push(TextRun {
                text: run.text[cut..].to_string(),
                marks: run.marks.clone(),
            });
        }
        offset += len;
    }
    (left, right)
}

pub(crate) fn slice_runs(runs: &[TextRun], from: usize, to: usize) -> Vec<TextRun> {
    let (_, rest) = split_runs(runs, from);
    let (mid, _) = split_runs(&rest, to - from);
    mid
}

pub(crate) fn replace_runs(
    runs: &[TextRun],
    from: usize,
    to: usize,
    insert: &[TextRun],
) -> Vec<TextRun> {
    let (mut left, rest) = split_runs(runs, from);
    let (_, right) = split_runs(&rest, to - from);
    left.extend(insert.iter().cloned());
    left.extend(right);
    normalize_runs(left)
}

pub(crate) fn update_marks(
    runs: &[TextRun],
    from: usize,
    to: usize,
    f: impl Fn(&mut BTreeSet<Mark>),
) -> Vec<TextRun> {
    let (mut left, rest) = split_runs(runs, from);
    let (mut mid, right) = split_runs(&rest, to - from);
    for run in &mut mid {
        f(&mut run.marks);
    }
    left.extend(mid);
    left.extend(right);
    normalize_runs(left)
}

/// Whether `mark` appears on any char in the range, and whether on all of them.
pub(crate) fn mark_coverage(runs: &[TextRun], from: usize, to: usize, mark: &Mark) -> (bool, bool) {
    let mid = slice_runs(runs, from, to);
    let any = mid.iter().any(|r| r.marks.contains(mark));
    let all = mid.iter().all(|r| r.marks.contains(mark));
    (any, all)
}

// ─── Blocks ─────────────────────────────────────────────────────────────────

/// A top-level block. Content is always normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    pub content: Vec<TextRun>,
}

impl Block {
    pub fn new(kind: BlockKind, content: Vec<TextRun>) -> Self {
        Self {
            kind,
            content: normalize_runs(content),
        }
    }

    pub fn empty(kind: BlockKind) -> Self {
        Self {
            kind,
            content: Vec::new(),
        }
    }

    pub fn paragraph(text: &str) -> Self {
        Self::new(BlockKind::Paragraph, vec![TextRun::plain(text)])
    }

    pub fn heading(level: u8, text: &str) -> Self {
        Self::new(BlockKind::Heading { level }, vec![TextRun::plain(text)])
    }

    pub fn content_size(&self) -> usize {
        runs_len(&self.content)
    }

    /// Content plus the opening and closing tokens.
    pub fn node_size(&self) -> usize {
        self.content_size() + 2
    }

    pub fn text(&self) -> String {
        self.content.iter().map(|r| r.text.as_str()).collect()
    }

    pub(crate) fn validate(&self) -> Result<(), InvalidStepError> {
        self.kind.validate()?;
        if !self.kind.allows_marks() {
            if let Some(mark) = self.content.iter().flat_map(|r| r.marks.iter()).next() {
                return Err(InvalidStepError::MarkNotAllowed {
                    mark: mark.to_string(),
                    kind: self.kind.to_string(),
                });
            }
        }
        Ok(())
    }
}

// ─── Slices ─────────────────────────────────────────────────────────────────

/// Content carried by a replace step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slice {
    /// Text inside a single block.
    Inline(Vec<TextRun>),
    /// Whole blocks between two block boundaries.
    Blocks(Vec<Block>),
}

impl Slice {
    pub fn empty() -> Self {
        Slice::Inline(Vec::new())
    }

    pub fn text(text: &str) -> Self {
        Slice::Inline(normalize_runs(vec![TextRun::plain(text)]))
    }

    /// Number of positions the slice occupies once inserted.
    pub fn size(&self) -> usize {
        match self {
            Slice::Inline(runs) => runs_len(runs),
            Slice::Blocks(blocks) => blocks.iter().map(Block::node_size).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

// ─── Document ───────────────────────────────────────────────────────────────

/// Where a flat position falls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedPos {
    /// Before block `index` (or after the last block when `index == len`).
    Boundary { index: usize },
    /// Inside the content of block `index`, `offset` chars in.
    Inside { index: usize, offset: usize },
}

/// An ordered, non-empty sequence of blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DocumentRepr")]
pub struct Document {
    blocks: Vec<Block>,
}

#[derive(Deserialize)]
struct DocumentRepr {
    blocks: Vec<Block>,
}

impl TryFrom<DocumentRepr> for Document {
    type Error = InvalidStepError;

    fn try_from(repr: DocumentRepr) -> Result<Self, Self::Error> {
        Document::new(repr.blocks)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::empty()
    }
}

impl Document {
    pub fn new(blocks: Vec<Block>) -> Result<Self, InvalidStepError> {
        if blocks.is_empty() {
            return Err(InvalidStepError::EmptyDocument);
        }
        let blocks: Vec<Block> = blocks
            .into_iter()
            .map(|b| Block::new(b.kind, b.content))
            .collect();
        for block in &blocks {
            block.validate()?;
        }
        Ok(Self { blocks })
    }

    /// A single empty paragraph (size 2).
    pub fn empty() -> Self {
        Self {
            blocks: vec![Block::empty(BlockKind::Paragraph)],
        }
    }

    pub fn from_paragraphs(texts: &[&str]) -> Self {
        if texts.is_empty() {
            return Self::empty();
        }
        Self {
            blocks: texts.iter().map(|t| Block::paragraph(t)).collect(),
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn size(&self) -> usize {
        self.blocks.iter().map(Block::node_size).sum()
    }

    /// Position of the opening token of block `index`.
    pub fn block_start(&self, index: usize) -> usize {
        self.blocks[..index.min(self.blocks.len())]
            .iter()
            .map(Block::node_size)
            .sum()
    }

    pub fn resolve(&self, pos: usize) -> Result<ResolvedPos, InvalidStepError> {
        let mut start = 0;
        for (index, block) in self.blocks.iter().enumerate() {
            if pos == start {
                return Ok(ResolvedPos::Boundary { index });
            }
            let content_end = start + 1 + block.content_size();
            if pos <= content_end {
                return Ok(ResolvedPos::Inside {
                    index,
                    offset: pos - start - 1,
                });
            }
            start += block.node_size();
        }
        if pos == start {
            Ok(ResolvedPos::Boundary {
                index: self.blocks.len(),
            })
        } else {
            Err(InvalidStepError::OutOfRange {
                pos,
                size: start,
            })
        }
    }

    /// Block texts joined with newlines.
    pub fn text_content(&self) -> String {
        self.blocks
            .iter()
            .map(Block::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub(crate) fn with_blocks(blocks: Vec<Block>) -> Result<Self, InvalidStepError> {
        if blocks.is_empty() {
            return Err(InvalidStepError::EmptyDocument);
        }
        Ok(Self { blocks })
    }
}

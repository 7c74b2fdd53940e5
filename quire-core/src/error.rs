//! Errors raised when a step no longer fits the document it is applied to.

use thiserror::Error;

/// A step's positions or node types do not match the document.
///
/// This is the corruption signal consumed by the sync engine: a step that
/// fails with this error is isolated and excluded rather than aborting the
/// whole replay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidStepError {
    #[error("position {pos} is outside the document (size {size})")]
    OutOfRange { pos: usize, size: usize },
    #[error("range {from}..{to} is inverted")]
    InvertedRange { from: usize, to: usize },
    #[error("range {from}..{to} does not lie inside a single block")]
    CrossesBlocks { from: usize, to: usize },
    #[error("position {pos} is not a block boundary")]
    NotABoundary { pos: usize },
    #[error("position {pos} is not inside block content")]
    NotInContent { pos: usize },
    #[error("mark {mark} is not allowed in {kind}")]
    MarkNotAllowed { mark: String, kind: String },
    #[error("invalid block type: {0}")]
    InvalidBlockType(String),
    #[error("the document must contain at least one block")]
    EmptyDocument,
    #[error("nothing to join at position {pos}")]
    NothingToJoin { pos: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InvalidStepError::OutOfRange { pos: 12, size: 4 };
        assert_eq!(err.to_string(), "position 12 is outside the document (size 4)");

        let err = InvalidStepError::CrossesBlocks { from: 1, to: 9 };
        assert!(err.to_string().contains("single block"));

        let err = InvalidStepError::MarkNotAllowed {
            mark: "strong".into(),
            kind: "code_block".into(),
        };
        assert_eq!(err.to_string(), "mark strong is not allowed in code_block");
    }
}

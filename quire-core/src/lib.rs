//! Document model and operational transform primitives for quire.
//!
//! ```text
//! ┌──────────┐   apply / invert   ┌──────────┐
//! │ Document │ ◄───────────────── │   Step   │
//! └──────────┘                    └────┬─────┘
//!                                      │ get_map
//!                                 ┌────▼─────┐   map(pos, assoc)
//!                                 │ StepMap  │ ──► Mapping (mirrors)
//!                                 └──────────┘         │
//!                                                 rebase_steps
//! ```
//!
//! Reference: Marijn Haverbeke — "Collaborative Editing in ProseMirror"

pub mod compress;
pub mod error;
pub mod mapping;
pub mod model;
pub mod rebase;
pub mod step;

pub use compress::compress_steps;
pub use error::InvalidStepError;
pub use mapping::{Assoc, MapRange, MapResult, Mapping, StepMap};
pub use model::{Block, BlockKind, Document, Mark, ResolvedPos, Slice, TextRun};
pub use rebase::{rebase_over_maps, rebase_steps, rebase_steps_after, Rebased};
pub use step::{apply_all, Step};

//! # quire-collab
//!
//! Log-based collaborative editing for `quire-core` documents.
//!
//! Every client appends its edits to a shared, totally ordered change log
//! through optimistic conditional writes, replays the log to build its
//! document, and rebases unsent local edits over whatever landed first.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────────────────┐     ┌──────────────┐
//! │ Editor UI   │ ──► │ DocumentHandle / SyncEngine  │ ──► │ LogStore     │
//! │             │ ◄── │  ChangeLogClient  (append)   │ ◄── │  Memory      │
//! │ RemoteChange│     │  CheckpointManager (every N) │     │  RocksDB     │
//! └─────────────┘     │  SelectionTracker (presence) │     └──────────────┘
//!                     │  ForkManager (fork/rebase)   │
//!                     └──────────────────────────────┘
//! ```
//!
//! Reference: Kleppmann — DDIA, Chapter 9 (Consistency and Consensus)

pub mod changelog;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod fork;
pub mod handle;
pub mod presence;
pub mod queue;
pub mod storage;

pub use changelog::{AppendAttempt, AppendOutcome, ChangeLogClient, ChangeSubscription, LogRecord};
pub use checkpoint::CheckpointManager;
pub use codec::{
    ChangeEntry, Checkpoint, CommitRecord, ForkRecord, Meta, MetaValue, SelectionRecord,
};
pub use config::EngineConfig;
pub use engine::{Connectivity, CorruptStep, FlushOutcome, RemoteChange, SyncEngine, SyncState};
pub use error::SyncError;
pub use fork::{ForkManager, RebaseOutcome};
pub use handle::{new_client_id, open_document, DocumentHandle};
pub use presence::{CursorColor, RemoteSelection, SelectionIntent, SelectionTracker};
pub use queue::{OfflineQueue, PendingEdit};
pub use storage::{LogStore, MemoryLogStore, RocksConfig, RocksLogStore, StoreError};

//! Error taxonomy for the sync engine.

use quire_core::InvalidStepError;

use crate::codec::CodecError;
use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A step does not apply to the document it was submitted against.
    #[error("invalid step: {0}")]
    InvalidStep(#[from] InvalidStepError),

    /// The append loop lost the race too many times in a row.
    #[error("append at key {key} conflicted {attempts} times")]
    AppendConflict { key: u64, attempts: u32 },

    #[error("log store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store failure other than unavailability.
    #[error("log store error: {0}")]
    Store(StoreError),

    #[error("checkpoint could not be decoded: {0}")]
    CorruptCheckpoint(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("engine is not live (state: {0})")]
    NotLive(String),

    #[error("offline queue is full ({0} edits)")]
    OfflineQueueFull(usize),

    #[error("fork not found: {0}")]
    ForkNotFound(String),

    #[error("fork already exists: {0}")]
    ForkExists(String),

    #[error("already merged: {0}")]
    AlreadyMerged(String),

    #[error("commit {commit_id} not found in {doc_id}")]
    CommitNotFound { doc_id: String, commit_id: u64 },

    /// A rebased step failed validation; nothing was written.
    #[error("rebase failed at step {index}: {source}")]
    RebaseFailed {
        index: usize,
        #[source]
        source: InvalidStepError,
    },
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(reason) => SyncError::StoreUnavailable(reason),
            other => SyncError::Store(other),
        }
    }
}

impl SyncError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SyncError::StoreUnavailable(_))
    }
}

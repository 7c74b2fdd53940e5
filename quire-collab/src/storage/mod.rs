//! Replicated log store primitives.
//!
//! Architecture:
//! ```text
//! ┌────────────┐  conditional_write   ┌─────────────────────────────┐
//! │ SyncEngine │ ───────────────────► │ LogStore                    │
//! │            │  read / read_children│                             │
//! │            │ ◄─────────────────── │  D/checkpoint               │
//! │            │                      │  D/changes/{key:020}        │
//! │            │  Subscription (mpsc) │  D/selections/{client}      │
//! │            │ ◄═══════════════════ │  D/fork_data, D/forks/{id}  │
//! └────────────┘                      │  D/commits/{id:020}         │
//!                                     └──────────────┬──────────────┘
//!                                                    │ ChangeFeed
//!                                                    ▼ (fan-out per prefix)
//! ```
//!
//! Change-log slots are only ever written through `conditional_write`, so
//! two entries can never share a key.
//!
//! Reference: Kleppmann — DDIA, Chapter 9 (Total Order Broadcast)

use std::future::Future;

use tokio::sync::mpsc;

pub mod feed;
pub mod memory;
pub mod rocks;

pub use feed::ChangeFeed;
pub use memory::MemoryLogStore;
pub use rocks::{RocksConfig, RocksLogStore};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached right now; callers should retry later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Result of a conditional write. `value` is the slot's final content:
/// ours when committed, the winner's otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub committed: bool,
    pub value: Option<Vec<u8>>,
    pub key: String,
}

/// Event delivered on a subscription, keyed by child name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Added { key: String, value: Vec<u8> },
    Changed { key: String, value: Vec<u8> },
    Removed { key: String },
}

impl FeedEvent {
    pub fn key(&self) -> &str {
        match self {
            FeedEvent::Added { key, .. }
            | FeedEvent::Changed { key, .. }
            | FeedEvent::Removed { key } => key,
        }
    }
}

/// Ordered single-consumer queue of child events under one prefix.
#[derive(Debug)]
pub struct Subscription {
    prefix: String,
    receiver: mpsc::UnboundedReceiver<FeedEvent>,
}

impl Subscription {
    pub fn new(prefix: impl Into<String>, receiver: mpsc::UnboundedReceiver<FeedEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            receiver,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Waits for the next event. `None` once the store drops the feed.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.receiver.recv().await
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.receiver.try_recv().ok()
    }
}

/// The primitives the sync engine needs from a replicated store.
///
/// Paths are `/`-separated. Children of a prefix are compared as strings,
/// so numeric keys must be zero-padded (see [`change_key`]).
pub trait LogStore: Send + Sync + 'static {
    fn read(&self, path: &str) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Runs `update` against the slot's current value and commits its
    /// result only if the slot was empty. `update` returning `None` aborts.
    fn conditional_write<F>(
        &self,
        path: &str,
        update: F,
    ) -> impl Future<Output = Result<WriteOutcome, StoreError>> + Send
    where
        F: FnOnce(Option<&[u8]>) -> Option<Vec<u8>> + Send;

    /// Unconditional write, for paths outside the change log.
    fn write(
        &self,
        path: &str,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn remove(&self, path: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Direct children of `prefix` with key `>= from_key`, in key order.
    fn read_children(
        &self,
        prefix: &str,
        from_key: Option<&str>,
    ) -> impl Future<Output = Result<Vec<(String, Vec<u8>)>, StoreError>> + Send;

    /// Live feed of direct children of `prefix`. Existing children with key
    /// `>= from_key` are delivered first as `Added`.
    fn subscribe(
        &self,
        prefix: &str,
        from_key: Option<&str>,
    ) -> impl Future<Output = Result<Subscription, StoreError>> + Send;

    /// Removes `path` when `connection` goes away.
    fn on_disconnect_cleanup(
        &self,
        connection: &str,
        path: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ─── Paths ──────────────────────────────────────────────────────────────────

pub fn checkpoint_path(doc_id: &str) -> String {
    format!("{doc_id}/checkpoint")
}

pub fn changes_prefix(doc_id: &str) -> String {
    format!("{doc_id}/changes")
}

/// Change keys are zero-padded so string order equals numeric order.
pub fn change_key(key: u64) -> String {
    format!("{key:020}")
}

pub fn change_path(doc_id: &str, key: u64) -> String {
    format!("{}/{}", changes_prefix(doc_id), change_key(key))
}

pub fn parse_key(key: &str) -> Option<u64> {
    key.parse().ok()
}

pub fn selections_prefix(doc_id: &str) -> String {
    format!("{doc_id}/selections")
}

pub fn selection_path(doc_id: &str, client_id: &str) -> String {
    format!("{}/{client_id}", selections_prefix(doc_id))
}

pub fn fork_data_path(doc_id: &str) -> String {
    format!("{doc_id}/fork_data")
}

pub fn fork_doc_path(doc_id: &str) -> String {
    format!("{doc_id}/fork_doc")
}

pub fn forks_prefix(doc_id: &str) -> String {
    format!("{doc_id}/forks")
}

pub fn fork_marker_path(doc_id: &str, fork_id: &str) -> String {
    format!("{}/{fork_id}", forks_prefix(doc_id))
}

pub fn commits_prefix(doc_id: &str) -> String {
    format!("{doc_id}/commits")
}

pub fn commit_path(doc_id: &str, commit_id: u64) -> String {
    format!("{}/{}", commits_prefix(doc_id), change_key(commit_id))
}

pub fn current_commit_path(doc_id: &str) -> String {
    format!("{doc_id}/current_commit")
}

/// Held by the client merging the whole of `fork_id`.
pub fn merge_claim_path(fork_id: &str) -> String {
    format!("{fork_id}/merge_claim")
}

pub fn commit_claim_path(fork_id: &str, commit_id: u64) -> String {
    format!("{fork_id}/commit_claims/{}", change_key(commit_id))
}

/// Splits `path` into `(parent, child)` at the last `/`.
pub(crate) fn split_path(path: &str) -> Result<(&str, &str), StoreError> {
    match path.rsplit_once('/') {
        Some((parent, child)) if !parent.is_empty() && !child.is_empty() => Ok((parent, child)),
        _ => Err(StoreError::InvalidPath(path.to_string())),
    }
}

/// The child key of `path` if it sits directly below `prefix`.
pub(crate) fn direct_child<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

//! Periodic document snapshots.
//!
//! After the entry at every multiple of the checkpoint interval is applied,
//! the document is written to `D/checkpoint` so new clients replay at most
//! one interval of entries. Writes run on background tasks and never block
//! editing; a failed write is logged and the next interval tries again.

use std::sync::Arc;

use futures_util::future::join_all;
use quire_core::Document;
use tokio::task::JoinHandle;

use crate::codec::{now_millis, Checkpoint};
use crate::error::SyncError;
use crate::storage::{checkpoint_path, LogStore};

/// Writes `checkpoint` unless the stored one is already at the same or a
/// later key. Returns whether it wrote.
pub(crate) async fn write_checkpoint<S: LogStore>(
    store: &S,
    doc_id: &str,
    checkpoint: &Checkpoint,
) -> Result<bool, SyncError> {
    let path = checkpoint_path(doc_id);
    if let Some(bytes) = store.read(&path).await? {
        match Checkpoint::decode(&bytes) {
            Ok(existing) if existing.key >= checkpoint.key => return Ok(false),
            Ok(_) => {}
            Err(e) => log::warn!("{doc_id}: overwriting undecodable checkpoint ({e})"),
        }
    }
    store.write(&path, checkpoint.encode()?).await?;
    Ok(true)
}

pub struct CheckpointManager<S: LogStore> {
    store: Arc<S>,
    doc_id: String,
    interval: u64,
    in_flight: Vec<JoinHandle<()>>,
}

impl<S: LogStore> CheckpointManager<S> {
    pub fn new(store: Arc<S>, doc_id: impl Into<String>, interval: u64) -> Self {
        Self {
            store,
            doc_id: doc_id.into(),
            interval,
            in_flight: Vec::new(),
        }
    }

    pub fn should_checkpoint(&self, key: u64) -> bool {
        self.interval > 0 && key > 0 && key % self.interval == 0
    }

    /// Starts a background write if `key` is on an interval boundary.
    /// `doc` must be the document after entry `key`.
    pub fn maybe_checkpoint(&mut self, key: u64, doc: &Document) -> bool {
        if !self.should_checkpoint(key) {
            return false;
        }
        let checkpoint = Checkpoint {
            key,
            snapshot: doc.clone(),
            timestamp: now_millis(),
        };
        let store = Arc::clone(&self.store);
        let doc_id = self.doc_id.clone();
        let handle = tokio::spawn(async move {
            match write_checkpoint(&*store, &doc_id, &checkpoint).await {
                Ok(true) => log::info!("{doc_id}: checkpoint written at key {}", checkpoint.key),
                Ok(false) => {
                    log::debug!("{doc_id}: checkpoint at key {} already superseded", checkpoint.key)
                }
                Err(e) => log::warn!("{doc_id}: checkpoint at key {} failed: {e}", checkpoint.key),
            }
        });
        self.in_flight.retain(|h| !h.is_finished());
        self.in_flight.push(handle);
        true
    }

    /// Number of writes not yet finished.
    pub fn pending(&self) -> usize {
        self.in_flight.iter().filter(|h| !h.is_finished()).count()
    }

    /// Waits for every in-flight write.
    pub async fn settle(&mut self) {
        for result in join_all(self.in_flight.drain(..)).await {
            if let Err(e) = result {
                log::warn!("{}: checkpoint task failed: {e}", self.doc_id);
            }
        }
    }
}

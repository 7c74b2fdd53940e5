//! The surface an editor UI talks to.

use std::sync::Arc;

use quire_core::{Document, Step};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::{CommitRecord, ForkRecord, Meta};
use crate::config::EngineConfig;
use crate::engine::{Connectivity, CorruptStep, FlushOutcome, RemoteChange, SyncEngine, SyncState};
use crate::error::SyncError;
use crate::fork::RebaseOutcome;
use crate::presence::{RemoteSelection, SelectionIntent};
use crate::storage::LogStore;

/// Opens `doc_id` for `client_id` and brings it live.
pub async fn open_document<S: LogStore>(
    store: Arc<S>,
    doc_id: &str,
    client_id: &str,
    config: EngineConfig,
) -> Result<DocumentHandle<S>, SyncError> {
    let mut engine = SyncEngine::new(store, doc_id, client_id, config);
    engine.open().await?;
    let changes = engine.take_remote_changes();
    Ok(DocumentHandle { engine, changes })
}

/// A fresh random client id.
pub fn new_client_id() -> String {
    Uuid::new_v4().to_string()
}

/// One open document.
pub struct DocumentHandle<S: LogStore> {
    engine: SyncEngine<S>,
    changes: Option<mpsc::UnboundedReceiver<RemoteChange>>,
}

impl<S: LogStore> DocumentHandle<S> {
    pub fn doc_id(&self) -> &str {
        self.engine.doc_id()
    }

    pub fn client_id(&self) -> &str {
        self.engine.client_id()
    }

    pub fn state(&self) -> SyncState {
        self.engine.state()
    }

    /// The document including local edits not yet in the log.
    pub fn document(&self) -> &Document {
        self.engine.document()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.engine.connectivity()
    }

    pub fn latest_key(&self) -> u64 {
        self.engine.latest_key()
    }

    pub fn corruption_report(&self) -> &[CorruptStep] {
        self.engine.corruption_report()
    }

    pub async fn submit_local_edit(
        &mut self,
        steps: Vec<Step>,
        meta: Meta,
    ) -> Result<FlushOutcome, SyncError> {
        self.engine.submit_local_edit(steps, meta).await
    }

    /// Retries queued local edits.
    pub async fn flush(&mut self) -> Result<FlushOutcome, SyncError> {
        self.engine.flush().await
    }

    /// The notification channel. Can only be taken once.
    pub fn on_remote_change(&mut self) -> Option<mpsc::UnboundedReceiver<RemoteChange>> {
        self.changes.take()
    }

    /// Handles everything already delivered by the store.
    pub async fn poll(&mut self) -> Result<usize, SyncError> {
        self.engine.poll().await
    }

    /// Waits for and handles the next store event.
    pub async fn next_change(&mut self) -> Result<bool, SyncError> {
        self.engine.next_change().await
    }

    pub fn active_selections(&self) -> Vec<RemoteSelection> {
        self.engine.active_selections()
    }

    pub async fn set_local_selection(
        &mut self,
        anchor: usize,
        head: usize,
        intent: SelectionIntent,
    ) -> Result<bool, SyncError> {
        self.engine.set_local_selection(anchor, head, intent).await
    }

    pub async fn fork(&mut self, new_id: &str) -> Result<ForkRecord, SyncError> {
        self.engine.forks().fork(new_id).await
    }

    /// Forks under a generated id.
    pub async fn fork_new(&mut self) -> Result<ForkRecord, SyncError> {
        let id = format!("{}-{}", self.engine.doc_id(), Uuid::new_v4().simple());
        self.fork(&id).await
    }

    pub async fn rebase(&mut self, fork_id: &str) -> Result<RebaseOutcome, SyncError> {
        self.engine.forks().rebase(fork_id).await
    }

    pub async fn rebase_commit(
        &mut self,
        fork_id: &str,
        commit_id: u64,
    ) -> Result<RebaseOutcome, SyncError> {
        self.engine.forks().rebase_commit(fork_id, commit_id).await
    }

    pub async fn list_forks(&mut self) -> Result<Vec<ForkRecord>, SyncError> {
        self.engine.forks().list_forks().await
    }

    pub async fn commit(&mut self, description: &str) -> Result<CommitRecord, SyncError> {
        self.engine.forks().commit(description).await
    }

    pub async fn list_commits(&mut self) -> Result<Vec<CommitRecord>, SyncError> {
        self.engine.forks().list_commits().await
    }

    /// Waits for background checkpoint writes.
    pub async fn settle(&mut self) {
        self.engine.settle_checkpoints().await;
    }

    pub fn engine(&self) -> &SyncEngine<S> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SyncEngine<S> {
        &mut self.engine
    }
}

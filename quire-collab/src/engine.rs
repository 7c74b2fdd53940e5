//! Per-document sync engine.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──open()──► Loading ──checkpoint──► Replaying ──entries──► Live
//!                             │                                           ▲
//!                             └── corrupt checkpoint: replay from key 0 ──┘
//! ```
//!
//! ## Live flow
//!
//! ```text
//! submit_local_edit ─► validate against view ─► OfflineQueue ─► flush()
//!                                                                  │
//!                           ChangeLogClient::append_entry ◄────────┘
//!                                  │ lost race: absorb winner, rebase, retry
//!                                  ▼
//!                          doc ← winners + our entry
//!
//! change feed ─► key ≤ latest: acknowledgement
//!             ─► key = latest+1: apply (with repair), rebase queued edits
//!             ─► key > latest+1: backfill the gap first
//! ```
//!
//! `doc` is the state after the last applied log entry; `view` is `doc`
//! plus every queued local edit, which is what the user sees.
//!
//! Reference: Kleppmann — DDIA, Chapter 9 (Total Order Broadcast)

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use quire_core::{
    apply_all, compress_steps, rebase_steps, Document, InvalidStepError, Mapping, Step,
};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use crate::changelog::{AppendOutcome, ChangeLogClient, ChangeSubscription, LogRecord};
use crate::checkpoint::CheckpointManager;
use crate::codec::{encode, now_millis, ChangeEntry, Meta};
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::presence::{RemoteSelection, SelectionIntent, SelectionTracker};
use crate::queue::{OfflineQueue, PendingEdit};
use crate::storage::{selection_path, selections_prefix, FeedEvent, LogStore, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    Loading,
    Replaying,
    Live,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncState::Uninitialized => "uninitialized",
            SyncState::Loading => "loading",
            SyncState::Replaying => "replaying",
            SyncState::Live => "live",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    /// The store is unreachable; local edits are queued.
    Offline,
}

/// A logged step that could not be applied and was left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptStep {
    pub key: u64,
    /// `None` when the whole entry was unreadable.
    pub index: Option<usize>,
    pub reason: String,
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    /// Another client's entry was applied.
    Applied { key: u64, client_id: String, steps: usize },
    SelectionsChanged,
    Connectivity(Connectivity),
    Corruption(CorruptStep),
    /// Queued local steps stopped applying after a rebase and were dropped.
    EditsExcluded { count: usize },
}

/// Result of pushing the queue to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Idle,
    Committed { key: u64 },
    /// Every queued step was excluded while rebasing.
    Emptied,
    /// The store is unreachable; `pending` edits remain queued.
    Queued { pending: usize },
}

/// Result of applying a list of steps one entry's worth at a time.
#[derive(Debug, Clone)]
pub(crate) struct Repaired {
    pub doc: Document,
    pub applied: Vec<Step>,
    pub failures: Vec<(usize, InvalidStepError)>,
}

/// Applies `steps` in order. If the batch fails as a whole, each step is
/// retried on its own and the ones that still fail are skipped.
pub(crate) fn apply_with_repair(doc: &Document, steps: &[Step]) -> Repaired {
    if let Ok(next) = apply_all(doc, steps) {
        return Repaired {
            doc: next,
            applied: steps.to_vec(),
            failures: Vec::new(),
        };
    }
    let mut current = doc.clone();
    let mut applied = Vec::with_capacity(steps.len());
    let mut failures = Vec::new();
    for (index, step) in steps.iter().enumerate() {
        match step.apply(&current) {
            Ok(next) => {
                current = next;
                applied.push(step.clone());
            }
            Err(e) => failures.push((index, e)),
        }
    }
    Repaired {
        doc: current,
        applied,
        failures,
    }
}

/// One log entry folded into a document.
#[derive(Debug, Clone)]
pub(crate) struct Absorbed {
    pub key: u64,
    pub client_id: Option<String>,
    pub applied: Vec<Step>,
    pub corrupt: Vec<CorruptStep>,
}

pub(crate) fn absorb_record(doc: &Document, record: &LogRecord) -> (Document, Absorbed) {
    match record {
        LogRecord::Entry(entry) => {
            let repaired = apply_with_repair(doc, &entry.steps);
            let corrupt = repaired
                .failures
                .into_iter()
                .map(|(index, e)| CorruptStep {
                    key: entry.key,
                    index: Some(index),
                    reason: e.to_string(),
                })
                .collect();
            (
                repaired.doc,
                Absorbed {
                    key: entry.key,
                    client_id: Some(entry.client_id.clone()),
                    applied: repaired.applied,
                    corrupt,
                },
            )
        }
        LogRecord::Undecodable { key, reason } => (
            doc.clone(),
            Absorbed {
                key: *key,
                client_id: None,
                applied: Vec::new(),
                corrupt: vec![CorruptStep {
                    key: *key,
                    index: None,
                    reason: reason.clone(),
                }],
            },
        ),
    }
}

/// Rebases `steps` over `over` and keeps the ones that still apply to
/// `base` in sequence. Returns the survivors and how many were excluded.
pub(crate) fn rebase_validated(
    steps: &[Step],
    over: &[Step],
    base: &Document,
) -> (Vec<Step>, usize) {
    let rebased = rebase_steps(steps, over);
    let mut excluded = rebased.dropped.len();
    for index in &rebased.dropped {
        log::warn!("excluding local step {index}: its target was deleted concurrently");
    }
    let mut view = base.clone();
    let mut survivors = Vec::with_capacity(rebased.steps.len());
    for step in rebased.steps {
        match step.apply(&view) {
            Ok(next) => {
                view = next;
                survivors.push(step);
            }
            Err(e) => {
                log::warn!("excluding local step {step}: {e}");
                excluded += 1;
            }
        }
    }
    (survivors, excluded)
}

/// Maps view positions from `doc + old` to `doc + over + new`. When `new`
/// lines up with `old` step for step, each surviving step mirrors its
/// original so positions inside locally inserted text survive.
fn view_mapping(old: &[Step], over: &[Step], new: &[Option<Step>]) -> Mapping {
    let mut mapping = Mapping::new();
    for step in old.iter().rev() {
        mapping.append_map(step.get_map().invert(), None);
    }
    for step in over {
        mapping.append_map(step.get_map(), None);
    }
    let aligned = new.len() == old.len();
    for (i, step) in new.iter().enumerate() {
        if let Some(step) = step {
            let mirror = aligned.then(|| old.len() - 1 - i);
            mapping.append_map(step.get_map(), mirror);
        }
    }
    mapping
}

/// Live sync state for one document on one client.
pub struct SyncEngine<S: LogStore> {
    doc_id: String,
    client_id: String,
    config: EngineConfig,
    state: SyncState,
    connectivity: Connectivity,

    doc: Document,
    view: Document,
    log: ChangeLogClient<S>,
    checkpoints: CheckpointManager<S>,
    selections: SelectionTracker,
    pending: OfflineQueue,
    /// Keys of our committed entries, until their echo arrives.
    self_changes: BTreeSet<u64>,
    corrupt: Vec<CorruptStep>,

    changes_sub: Option<ChangeSubscription>,
    selections_sub: Option<Subscription>,
    sweep: Option<Interval>,
    cleanup_registered: bool,

    events_tx: mpsc::UnboundedSender<RemoteChange>,
    events_rx: Option<mpsc::UnboundedReceiver<RemoteChange>>,
}

impl<S: LogStore> SyncEngine<S> {
    /// Creates an engine in `Uninitialized`. Call [`open`](Self::open)
    /// before editing.
    pub fn new(
        store: Arc<S>,
        doc_id: impl Into<String>,
        client_id: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        let doc_id = doc_id.into();
        let client_id = client_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            log: ChangeLogClient::new(
                Arc::clone(&store),
                doc_id.clone(),
                client_id.clone(),
                &config,
            ),
            checkpoints: CheckpointManager::new(store, doc_id.clone(), config.checkpoint_interval),
            selections: SelectionTracker::new(client_id.clone(), &config),
            pending: OfflineQueue::new(config.offline_queue_capacity),
            doc_id,
            client_id,
            config,
            state: SyncState::Uninitialized,
            connectivity: Connectivity::Online,
            doc: Document::empty(),
            view: Document::empty(),
            self_changes: BTreeSet::new(),
            corrupt: Vec::new(),
            changes_sub: None,
            selections_sub: None,
            sweep: None,
            cleanup_registered: false,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Loads, replays and goes live.
    pub async fn open(&mut self) -> Result<(), SyncError> {
        self.load().await?;
        self.go_live().await
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    /// What the user sees: the log state plus queued local edits.
    pub fn document(&self) -> &Document {
        &self.view
    }

    /// State after the last applied log entry.
    pub fn confirmed_document(&self) -> &Document {
        &self.doc
    }

    pub fn latest_key(&self) -> u64 {
        self.log.latest_key()
    }

    pub fn pending_edits(&self) -> usize {
        self.pending.len()
    }

    /// Own entries whose echo has not come back yet.
    pub fn unacknowledged(&self) -> usize {
        self.self_changes.len()
    }

    pub fn corruption_report(&self) -> &[CorruptStep] {
        &self.corrupt
    }

    pub fn active_selections(&self) -> Vec<RemoteSelection> {
        self.selections.active_selections()
    }

    /// The notification channel. Can only be taken once.
    pub fn take_remote_changes(&mut self) -> Option<mpsc::UnboundedReceiver<RemoteChange>> {
        self.events_rx.take()
    }

    /// Waits for in-flight checkpoint writes.
    pub async fn settle_checkpoints(&mut self) {
        self.checkpoints.settle().await;
    }

    pub(crate) fn store(&self) -> &Arc<S> {
        self.log.store()
    }

    pub(crate) fn log_client(&self) -> &ChangeLogClient<S> {
        &self.log
    }

    // ─── State machine ──────────────────────────────────────────────────

    fn set_state(&mut self, state: SyncState) {
        log::info!("{}: {} -> {}", self.doc_id, self.state, state);
        self.state = state;
    }

    pub(crate) fn ensure_live(&self) -> Result<(), SyncError> {
        if self.state == SyncState::Live {
            Ok(())
        } else {
            Err(SyncError::NotLive(self.state.to_string()))
        }
    }

    fn notify(&self, change: RemoteChange) {
        // The UI may not be listening.
        let _ = self.events_tx.send(change);
    }

    fn set_connectivity(&mut self, connectivity: Connectivity) {
        if self.connectivity != connectivity {
            log::info!(
                "{}: connectivity {:?} -> {:?}",
                self.doc_id,
                self.connectivity,
                connectivity
            );
            self.connectivity = connectivity;
            self.notify(RemoteChange::Connectivity(connectivity));
        }
    }

    async fn load(&mut self) -> Result<(), SyncError> {
        self.set_state(SyncState::Loading);
        let (doc, base) = match self.log.load_checkpoint().await {
            Ok(Some(checkpoint)) => (checkpoint.snapshot, checkpoint.key),
            Ok(None) => (Document::empty(), 0),
            Err(SyncError::CorruptCheckpoint(reason)) => {
                log::warn!("{}: {reason}; replaying from key 0", self.doc_id);
                (Document::empty(), 0)
            }
            Err(e) => return Err(e),
        };
        self.doc = doc;
        self.log.advance_to(base);

        self.set_state(SyncState::Replaying);
        let records = self.log.load_entries(base + 1).await?;
        log::debug!("{}: replaying {} entries after key {base}", self.doc_id, records.len());
        for record in records {
            self.absorb_remote(record);
        }
        self.view = self.doc.clone();
        Ok(())
    }

    async fn go_live(&mut self) -> Result<(), SyncError> {
        let from = self.log.latest_key() + 1;
        self.changes_sub = Some(self.log.subscribe(from).await?);
        self.selections_sub = Some(
            self.store()
                .subscribe(&selections_prefix(&self.doc_id), None)
                .await?,
        );
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.sweep = Some(sweep);
        self.set_state(SyncState::Live);
        Ok(())
    }

    // ─── Applying log entries ───────────────────────────────────────────

    fn record_corruption(&mut self, corrupt: CorruptStep) {
        match corrupt.index {
            Some(index) => log::warn!(
                "{}: step {index} of entry {} is corrupt and was skipped: {}",
                self.doc_id,
                corrupt.key,
                corrupt.reason
            ),
            None => log::warn!(
                "{}: entry {} is unreadable and was skipped: {}",
                self.doc_id,
                corrupt.key,
                corrupt.reason
            ),
        }
        self.notify(RemoteChange::Corruption(corrupt.clone()));
        self.corrupt.push(corrupt);
    }

    /// Records the side effects of entries already folded into a document.
    /// Returns their applied steps in order.
    fn settle_absorbed(&mut self, absorbed: Vec<Absorbed>) -> Vec<Step> {
        let mut over = Vec::new();
        for entry in absorbed {
            for corrupt in entry.corrupt {
                self.record_corruption(corrupt);
            }
            if self.state == SyncState::Live {
                if let Some(client_id) = entry.client_id {
                    self.notify(RemoteChange::Applied {
                        key: entry.key,
                        client_id,
                        steps: entry.applied.len(),
                    });
                }
            }
            over.extend(entry.applied);
        }
        over
    }

    /// Applies the entry at `latest_key + 1` from another client and moves
    /// queued local edits on top of it.
    fn absorb_remote(&mut self, record: LogRecord) {
        let key = record.key();
        let (doc, absorbed) = absorb_record(&self.doc, &record);
        self.doc = doc;
        self.log.advance_to(key);
        let over = self.settle_absorbed(vec![absorbed]);
        if self.state != SyncState::Live {
            return;
        }

        let old = self.pending.steps();
        let new = self.rebase_pending(&over);
        self.selections.remap(&view_mapping(&old, &over, &new));
        self.selections.clamp(self.view.size());
    }

    /// Rebases every queued edit over `over`, which has just been applied to
    /// `doc`. Returns the new steps aligned with the old ones.
    fn rebase_pending(&mut self, over: &[Step]) -> Vec<Option<Step>> {
        if self.pending.is_empty() {
            self.view = self.doc.clone();
            return Vec::new();
        }
        let old = self.pending.steps();
        let rebased = rebase_steps(&old, over);
        let dropped: HashSet<usize> = rebased.dropped.iter().copied().collect();
        let mut survivors = rebased.steps.into_iter();
        let aligned: Vec<Option<Step>> = (0..old.len())
            .map(|i| if dropped.contains(&i) { None } else { survivors.next() })
            .collect();
        for index in &rebased.dropped {
            log::warn!(
                "{}: queued step {index} excluded, its target was deleted remotely",
                self.doc_id
            );
        }
        self.pending.redistribute(aligned.clone());
        let excluded = rebased.dropped.len() + self.revalidate_pending();
        if excluded > 0 {
            self.notify(RemoteChange::EditsExcluded { count: excluded });
        }
        aligned
    }

    /// Re-applies the queue to `doc`, dropping steps that no longer apply.
    fn revalidate_pending(&mut self) -> usize {
        let mut view = self.doc.clone();
        let mut excluded = 0;
        let doc_id = &self.doc_id;
        self.pending.retain_steps(|step| match step.apply(&view) {
            Ok(next) => {
                view = next;
                true
            }
            Err(e) => {
                log::warn!("{doc_id}: queued step {step} excluded: {e}");
                excluded += 1;
                false
            }
        });
        self.view = view;
        excluded
    }

    /// Handles one record from the change feed.
    async fn handle_record(&mut self, record: LogRecord) -> Result<(), SyncError> {
        let key = record.key();
        let latest = self.log.latest_key();
        if key <= latest {
            if let LogRecord::Entry(entry) = &record {
                if entry.client_id == self.client_id && self.self_changes.remove(&key) {
                    log::trace!("{}: entry {key} acknowledged", self.doc_id);
                }
            }
            return Ok(());
        }
        if key > latest + 1 {
            log::debug!("{}: feed skipped from {latest} to {key}, backfilling", self.doc_id);
            for earlier in self.log.load_entries(latest + 1).await? {
                if earlier.key() >= key {
                    break;
                }
                self.absorb_remote(earlier);
            }
            if self.log.latest_key() + 1 != key {
                log::warn!(
                    "{}: entries {}..{key} missing from the log",
                    self.doc_id,
                    self.log.latest_key() + 1
                );
            }
        }
        self.absorb_remote(record);
        Ok(())
    }

    fn handle_selection_event(&mut self, event: FeedEvent) {
        if self.selections.handle_feed_event(event, self.view.size()) {
            self.notify(RemoteChange::SelectionsChanged);
        }
    }

    // ─── Event loop ─────────────────────────────────────────────────────

    /// Handles every event already queued on the feeds. Returns how many.
    pub async fn poll(&mut self) -> Result<usize, SyncError> {
        self.ensure_live()?;
        let mut handled = 0;
        while let Some(record) = self.changes_sub.as_mut().and_then(ChangeSubscription::try_recv) {
            self.handle_record(record).await?;
            handled += 1;
        }
        while let Some(event) = self.selections_sub.as_mut().and_then(Subscription::try_recv) {
            self.handle_selection_event(event);
            handled += 1;
        }
        Ok(handled)
    }

    /// Waits for the next feed event or sweep tick and handles it. Returns
    /// `false` once the store has closed the feeds.
    pub async fn next_change(&mut self) -> Result<bool, SyncError> {
        enum Next {
            Change(Option<LogRecord>),
            Selection(Option<FeedEvent>),
            Tick,
        }

        let next = {
            let (Some(changes), Some(selections), Some(sweep)) = (
                self.changes_sub.as_mut(),
                self.selections_sub.as_mut(),
                self.sweep.as_mut(),
            ) else {
                return Err(SyncError::NotLive(self.state.to_string()));
            };
            tokio::select! {
                record = changes.recv() => Next::Change(record),
                event = selections.recv() => Next::Selection(event),
                _ = sweep.tick() => Next::Tick,
            }
        };

        match next {
            Next::Change(Some(record)) => self.handle_record(record).await?,
            Next::Selection(Some(event)) => self.handle_selection_event(event),
            Next::Change(None) | Next::Selection(None) => return Ok(false),
            Next::Tick => {
                if !self.selections.sweep(now_millis()).is_empty() {
                    self.notify(RemoteChange::SelectionsChanged);
                }
                if self.connectivity == Connectivity::Offline && !self.pending.is_empty() {
                    self.flush().await?;
                }
            }
        }
        Ok(true)
    }

    // ─── Local edits ────────────────────────────────────────────────────

    /// Validates `steps` against the current view, queues them and tries
    /// to push the queue to the log.
    pub async fn submit_local_edit(
        &mut self,
        steps: Vec<Step>,
        meta: Meta,
    ) -> Result<FlushOutcome, SyncError> {
        self.ensure_live()?;
        if steps.is_empty() {
            return Ok(FlushOutcome::Idle);
        }
        let next = apply_all(&self.view, &steps)?;
        let mapping = Mapping::from_maps(steps.iter().map(Step::get_map));
        if !self.pending.enqueue(PendingEdit { steps, meta }) {
            return Err(SyncError::OfflineQueueFull(self.pending.capacity()));
        }
        self.view = next;
        self.selections.remap(&mapping);
        self.flush().await
    }

    /// Appends every queued edit as one log entry.
    pub async fn flush(&mut self) -> Result<FlushOutcome, SyncError> {
        self.ensure_live()?;
        if self.pending.is_empty() {
            return Ok(FlushOutcome::Idle);
        }
        let original = self.pending.steps();
        let meta = self.pending.merged_meta();
        let steps = compress_steps(&original);

        let mut current = steps.clone();
        let mut excluded = 0;
        let (result, over) = self
            .append_tracked(steps, meta.clone(), |shadow, applied, _| {
                let (survivors, dropped) = rebase_validated(&current, applied, shadow);
                current = survivors;
                excluded += dropped;
                Ok(current.clone())
            })
            .await;
        if excluded > 0 {
            self.notify(RemoteChange::EditsExcluded { count: excluded });
        }

        match result {
            Ok(AppendOutcome::Committed { entry, .. }) => {
                let key = entry.key;
                self.pending.clear();
                self.apply_committed(entry, &original, &over);
                self.remember_own(key);
                self.set_connectivity(Connectivity::Online);
                Ok(FlushOutcome::Committed { key })
            }
            Ok(AppendOutcome::Emptied { .. }) => {
                self.pending.clear();
                self.view = self.doc.clone();
                self.selections.remap(&view_mapping(&original, &over, &[]));
                self.set_connectivity(Connectivity::Online);
                Ok(FlushOutcome::Emptied)
            }
            Err(e) => {
                if !over.is_empty() {
                    let new: Vec<Option<Step>> = current.iter().cloned().map(Some).collect();
                    self.pending.replace_all(current, meta);
                    self.revalidate_pending();
                    self.selections.remap(&view_mapping(&original, &over, &new));
                }
                if e.is_unavailable() {
                    log::warn!(
                        "{}: store unavailable, {} edits queued: {e}",
                        self.doc_id,
                        self.pending.len()
                    );
                    self.set_connectivity(Connectivity::Offline);
                    Ok(FlushOutcome::Queued {
                        pending: self.pending.len(),
                    })
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Runs the append loop, folding every winning entry into a shadow of
    /// `doc` before `rebuild` sees it. On return `doc` includes every
    /// winner; the second value holds their applied steps.
    pub(crate) async fn append_tracked<F>(
        &mut self,
        steps: Vec<Step>,
        meta: Meta,
        mut rebuild: F,
    ) -> (Result<AppendOutcome, SyncError>, Vec<Step>)
    where
        F: FnMut(&Document, &[Step], &LogRecord) -> Result<Vec<Step>, SyncError>,
    {
        let mut shadow = self.doc.clone();
        let mut absorbed = Vec::new();
        let result = self
            .log
            .append_entry(steps, meta, |winner| {
                let (next, entry) = absorb_record(&shadow, winner);
                shadow = next;
                let rebuilt = rebuild(&shadow, &entry.applied, winner);
                absorbed.push(entry);
                rebuilt
            })
            .await;
        self.doc = shadow;
        let over = self.settle_absorbed(absorbed);
        (result, over)
    }

    /// Tracks our entry at `key` until its echo arrives.
    pub(crate) fn remember_own(&mut self, key: u64) {
        self.self_changes.insert(key);
    }

    /// Flushes the queue and fails if edits are still waiting for the store.
    pub(crate) async fn flush_all(&mut self) -> Result<(), SyncError> {
        match self.flush().await? {
            FlushOutcome::Queued { pending } => Err(SyncError::StoreUnavailable(format!(
                "{pending} local edits still queued"
            ))),
            _ => Ok(()),
        }
    }

    /// Applies our own freshly committed entry. `old` is what the view held
    /// on top of `doc` before the append, `over` the winners applied since.
    pub(crate) fn apply_committed(&mut self, entry: ChangeEntry, old: &[Step], over: &[Step]) {
        let repaired = apply_with_repair(&self.doc, &entry.steps);
        for (index, e) in &repaired.failures {
            self.record_corruption(CorruptStep {
                key: entry.key,
                index: Some(*index),
                reason: e.to_string(),
            });
        }
        self.doc = repaired.doc;
        if !over.is_empty() {
            let new: Vec<Option<Step>> = entry.steps.iter().cloned().map(Some).collect();
            self.selections.remap(&view_mapping(old, over, &new));
        }
        self.revalidate_pending();
        self.selections.clamp(self.view.size());
        self.checkpoints.maybe_checkpoint(entry.key, &self.doc);
    }

    // ─── Selections ─────────────────────────────────────────────────────

    /// Updates the local selection, publishing it when `intent` is
    /// [`SelectionIntent::Pointer`] and it changed. Returns whether it was
    /// published.
    pub async fn set_local_selection(
        &mut self,
        anchor: usize,
        head: usize,
        intent: SelectionIntent,
    ) -> Result<bool, SyncError> {
        self.ensure_live()?;
        let size = self.view.size();
        let (anchor, head) = (anchor.min(size), head.min(size));
        let update = self
            .selections
            .set_local_selection(anchor, head, intent, self.log.latest_key(), now_millis());
        let Some(record) = update else {
            return Ok(false);
        };
        let path = selection_path(&self.doc_id, &self.client_id);
        let store = Arc::clone(self.store());
        store.write(&path, encode(&record)?).await?;
        if !self.cleanup_registered {
            store.on_disconnect_cleanup(&self.client_id, &path).await?;
            self.cleanup_registered = true;
        }
        Ok(true)
    }

    pub fn local_selection(&self) -> Option<(usize, usize)> {
        self.selections.local_selection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{change_path, MemoryLogStore};
    use quire_core::{Block, BlockKind};

    fn config() -> EngineConfig {
        EngineConfig::for_testing()
    }

    async fn open(store: &Arc<MemoryLogStore>, client: &str) -> SyncEngine<MemoryLogStore> {
        let mut engine = SyncEngine::new(Arc::clone(store), "doc", client, config());
        engine.open().await.unwrap();
        engine
    }

    #[test]
    fn test_repair_skips_only_failing_steps() {
        let doc = Document::from_paragraphs(&["abc"]);
        let steps = vec![
            Step::insert_text(1, "x"),
            Step::delete(40, 50),
            Step::insert_text(5, "y"),
        ];
        let repaired = apply_with_repair(&doc, &steps);
        assert_eq!(repaired.doc.text_content(), "xabcy");
        assert_eq!(repaired.applied.len(), 2);
        assert_eq!(repaired.failures.len(), 1);
        assert_eq!(repaired.failures[0].0, 1);
    }

    #[tokio::test]
    async fn test_open_empty_document() {
        let store = Arc::new(MemoryLogStore::new());
        let mut engine = SyncEngine::new(Arc::clone(&store), "doc", "a", config());
        assert_eq!(engine.state(), SyncState::Uninitialized);
        assert!(matches!(
            engine.submit_local_edit(vec![Step::insert_text(1, "x")], Meta::new()).await,
            Err(SyncError::NotLive(_))
        ));
        engine.open().await.unwrap();
        assert_eq!(engine.state(), SyncState::Live);
        assert_eq!(engine.document(), &Document::empty());
        assert_eq!(engine.latest_key(), 0);
    }

    #[tokio::test]
    async fn test_local_edit_commits() {
        let store = Arc::new(MemoryLogStore::new());
        let mut engine = open(&store, "a").await;
        let outcome = engine
            .submit_local_edit(vec![Step::insert_text(1, "hi")], Meta::new())
            .await
            .unwrap();
        assert_eq!(outcome, FlushOutcome::Committed { key: 1 });
        assert_eq!(engine.document().text_content(), "hi");
        assert_eq!(engine.confirmed_document(), engine.document());
        assert_eq!(engine.unacknowledged(), 1);

        // own echo acknowledges the entry
        engine.poll().await.unwrap();
        assert_eq!(engine.unacknowledged(), 0);
        assert_eq!(engine.document().text_content(), "hi");
    }

    #[tokio::test]
    async fn test_invalid_local_edit_rejected() {
        let store = Arc::new(MemoryLogStore::new());
        let mut engine = open(&store, "a").await;
        let err = engine
            .submit_local_edit(vec![Step::delete(1, 30)], Meta::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidStep(_)));
        assert_eq!(engine.pending_edits(), 0);
    }

    #[tokio::test]
    async fn test_remote_entry_applied() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = open(&store, "a").await;
        let mut b = open(&store, "b").await;
        let mut events = b.take_remote_changes().unwrap();

        a.submit_local_edit(vec![Step::insert_text(1, "hello")], Meta::new())
            .await
            .unwrap();
        b.poll().await.unwrap();
        assert_eq!(b.document().text_content(), "hello");
        assert_eq!(
            events.try_recv().unwrap(),
            RemoteChange::Applied {
                key: 1,
                client_id: "a".into(),
                steps: 1
            }
        );
    }

    #[tokio::test]
    async fn test_lost_race_rebases_local_edit() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = open(&store, "a").await;
        let mut b = open(&store, "b").await;

        a.submit_local_edit(vec![Step::insert_text(1, "hello")], Meta::new())
            .await
            .unwrap();
        // b has not seen key 1 yet
        let outcome = b
            .submit_local_edit(vec![Step::insert_text(1, "world")], Meta::new())
            .await
            .unwrap();
        assert_eq!(outcome, FlushOutcome::Committed { key: 2 });
        assert_eq!(b.document().text_content(), "helloworld");

        a.poll().await.unwrap();
        b.poll().await.unwrap();
        assert_eq!(a.document(), b.document());
    }

    #[tokio::test]
    async fn test_offline_edits_queue_and_flush() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = open(&store, "a").await;
        let mut events = a.take_remote_changes().unwrap();

        store.set_available(false);
        let outcome = a
            .submit_local_edit(vec![Step::insert_text(1, "off")], Meta::new())
            .await
            .unwrap();
        assert_eq!(outcome, FlushOutcome::Queued { pending: 1 });
        assert_eq!(a.connectivity(), Connectivity::Offline);
        assert_eq!(a.document().text_content(), "off");
        assert_eq!(a.confirmed_document(), &Document::empty());
        assert_eq!(
            events.try_recv().unwrap(),
            RemoteChange::Connectivity(Connectivity::Offline)
        );

        a.submit_local_edit(vec![Step::insert_text(4, "line")], Meta::new())
            .await
            .unwrap();
        assert_eq!(a.pending_edits(), 2);

        store.set_available(true);
        assert_eq!(a.flush().await.unwrap(), FlushOutcome::Committed { key: 1 });
        assert_eq!(a.connectivity(), Connectivity::Online);
        assert_eq!(a.confirmed_document().text_content(), "offline");
    }

    #[tokio::test]
    async fn test_queue_full() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = open(&store, "a").await;
        store.set_available(false);
        for _ in 0..a.config().offline_queue_capacity {
            a.submit_local_edit(vec![Step::insert_text(1, "x")], Meta::new())
                .await
                .unwrap();
        }
        assert!(matches!(
            a.submit_local_edit(vec![Step::insert_text(1, "x")], Meta::new()).await,
            Err(SyncError::OfflineQueueFull(64))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_entry_isolated_on_replay() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = open(&store, "a").await;
        a.submit_local_edit(vec![Step::insert_text(1, "ok")], Meta::new())
            .await
            .unwrap();

        let bad = ChangeEntry {
            key: 2,
            steps: vec![Step::insert_text(3, "!"), Step::delete(10, 90)],
            client_id: "evil".into(),
            meta: Meta::new(),
            timestamp: 0,
        };
        let bytes = bad.encode().unwrap();
        store
            .conditional_write(&change_path("doc", 2), move |_| Some(bytes))
            .await
            .unwrap();
        store
            .conditional_write(&change_path("doc", 3), |_| Some(vec![7, 7, 7]))
            .await
            .unwrap();

        let b = open(&store, "b").await;
        assert_eq!(b.document().text_content(), "ok!");
        assert_eq!(b.latest_key(), 3);
        let report: Vec<(u64, Option<usize>)> =
            b.corruption_report().iter().map(|c| (c.key, c.index)).collect();
        assert_eq!(report, vec![(2, Some(1)), (3, None)]);
    }

    #[tokio::test]
    async fn test_pending_rebased_over_remote_entry() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = open(&store, "a").await;
        let mut b = open(&store, "b").await;

        store.set_available(false);
        b.submit_local_edit(vec![Step::insert_text(1, "tail")], Meta::new())
            .await
            .unwrap();
        store.set_available(true);

        a.submit_local_edit(
            vec![Step::Split { pos: 1, kind: BlockKind::Paragraph }],
            Meta::new(),
        )
        .await
        .unwrap();
        b.poll().await.unwrap();
        assert_eq!(b.pending_edits(), 1);
        assert_eq!(b.confirmed_document().blocks().len(), 2);

        b.flush().await.unwrap();
        a.poll().await.unwrap();
        assert_eq!(a.document(), b.document());
        assert_eq!(
            b.document().blocks()[1],
            Block::paragraph("tail")
        );
    }

    #[tokio::test]
    async fn test_selection_broadcast_and_cleanup() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = open(&store, "a").await;
        let mut b = open(&store, "b").await;
        a.submit_local_edit(vec![Step::insert_text(1, "hello")], Meta::new())
            .await
            .unwrap();
        b.poll().await.unwrap();

        assert!(a.set_local_selection(2, 4, SelectionIntent::Pointer).await.unwrap());
        assert!(!a.set_local_selection(2, 4, SelectionIntent::Pointer).await.unwrap());
        b.poll().await.unwrap();
        let active = b.active_selections();
        assert_eq!(active.len(), 1);
        assert_eq!((active[0].client_id.as_str(), active[0].anchor, active[0].head), ("a", 2, 4));

        store.drop_connection("a").await;
        b.poll().await.unwrap();
        assert!(b.active_selections().is_empty());
    }

    #[tokio::test]
    async fn test_selection_after_reopen_replaces_old_one() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = open(&store, "a").await;
        let mut b = open(&store, "b").await;
        a.submit_local_edit(vec![Step::insert_text(1, "0123456789")], Meta::new())
            .await
            .unwrap();
        for anchor in 1..=5 {
            a.set_local_selection(anchor, anchor, SelectionIntent::Pointer)
                .await
                .unwrap();
        }
        b.poll().await.unwrap();
        assert_eq!(b.active_selections()[0].anchor, 5);
        assert_eq!(b.active_selections()[0].version, 1);
        drop(a);

        let mut a = open(&store, "a").await;
        assert!(a.set_local_selection(9, 9, SelectionIntent::Pointer).await.unwrap());
        b.poll().await.unwrap();
        let active = b.active_selections();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].anchor, 9);
    }
}

//! Change log client: checkpoint reads, gapless replay reads and the
//! optimistic append loop.
//!
//! ```text
//!   append_entry(steps)
//!        │
//!        ▼
//!   conditional_write(D/changes/{latest+1}) ──committed──► Committed
//!        │ occupied
//!        ▼
//!   decode winner, latest = winner.key
//!        │
//!        ▼
//!   rebuild(&winner) ──► steps for the next slot (empty ⇒ Emptied)
//! ```
//!
//! A slot is never overwritten, so every key holds exactly one entry and all
//! clients agree on the order.

use std::sync::Arc;

use quire_core::Step;

use crate::codec::{now_millis, ChangeEntry, Checkpoint, Meta};
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::storage::{
    change_key, change_path, changes_prefix, checkpoint_path, parse_key, FeedEvent, LogStore,
    StoreError, Subscription,
};

/// A change-log slot as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Entry(ChangeEntry),
    /// The slot is occupied but its bytes do not decode.
    Undecodable { key: u64, reason: String },
}

impl LogRecord {
    pub fn key(&self) -> u64 {
        match self {
            LogRecord::Entry(entry) => entry.key,
            LogRecord::Undecodable { key, .. } => *key,
        }
    }

    pub fn entry(&self) -> Option<&ChangeEntry> {
        match self {
            LogRecord::Entry(entry) => Some(entry),
            LogRecord::Undecodable { .. } => None,
        }
    }

    pub fn into_entry(self) -> Option<ChangeEntry> {
        match self {
            LogRecord::Entry(entry) => Some(entry),
            LogRecord::Undecodable { .. } => None,
        }
    }

    fn decode(key: u64, bytes: &[u8]) -> Self {
        match ChangeEntry::decode(bytes) {
            Ok(entry) if entry.key == key => LogRecord::Entry(entry),
            Ok(entry) => LogRecord::Undecodable {
                key,
                reason: format!("entry claims key {} at slot {key}", entry.key),
            },
            Err(e) => LogRecord::Undecodable {
                key,
                reason: e.to_string(),
            },
        }
    }
}

/// Result of a single conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendAttempt {
    Committed(ChangeEntry),
    /// Someone else holds the slot.
    Conflict(LogRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Committed { entry: ChangeEntry, attempts: u32 },
    /// Rebuilding left nothing to write.
    Emptied { attempts: u32 },
}

/// Ordered feed of new log entries.
#[derive(Debug)]
pub struct ChangeSubscription {
    inner: Subscription,
}

impl ChangeSubscription {
    fn record(event: FeedEvent) -> Option<LogRecord> {
        match event {
            FeedEvent::Added { key, value } | FeedEvent::Changed { key, value } => {
                let Some(parsed) = parse_key(&key) else {
                    log::warn!("ignoring change slot with non-numeric key {key}");
                    return None;
                };
                Some(LogRecord::decode(parsed, &value))
            }
            FeedEvent::Removed { key } => {
                log::trace!("change slot {key} removed");
                None
            }
        }
    }

    /// Waits for the next entry. `None` once the feed closes.
    pub async fn recv(&mut self) -> Option<LogRecord> {
        loop {
            let event = self.inner.recv().await?;
            if let Some(record) = Self::record(event) {
                return Some(record);
            }
        }
    }

    /// Next queued entry without waiting.
    pub fn try_recv(&mut self) -> Option<LogRecord> {
        while let Some(event) = self.inner.try_recv() {
            if let Some(record) = Self::record(event) {
                return Some(record);
            }
        }
        None
    }
}

/// Reads and appends one document's change log.
#[derive(Debug)]
pub struct ChangeLogClient<S: LogStore> {
    store: Arc<S>,
    doc_id: String,
    client_id: String,
    latest_key: u64,
    max_attempts: u32,
}

impl<S: LogStore> ChangeLogClient<S> {
    pub fn new(
        store: Arc<S>,
        doc_id: impl Into<String>,
        client_id: impl Into<String>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            doc_id: doc_id.into(),
            client_id: client_id.into(),
            latest_key: 0,
            max_attempts: config.max_append_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Highest key this client knows to be occupied.
    pub fn latest_key(&self) -> u64 {
        self.latest_key
    }

    /// Never moves backwards.
    pub fn advance_to(&mut self, key: u64) {
        self.latest_key = self.latest_key.max(key);
    }

    pub async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, SyncError> {
        let Some(bytes) = self.store.read(&checkpoint_path(&self.doc_id)).await? else {
            return Ok(None);
        };
        Checkpoint::decode(&bytes)
            .map(Some)
            .map_err(|e| SyncError::CorruptCheckpoint(e.to_string()))
    }

    /// Entries from `from_key` on, in key order. Reading stops at the first
    /// missing key.
    pub async fn load_entries(&self, from_key: u64) -> Result<Vec<LogRecord>, SyncError> {
        let children = self
            .store
            .read_children(&changes_prefix(&self.doc_id), Some(&change_key(from_key)))
            .await?;

        let mut records = Vec::with_capacity(children.len());
        let mut expected = from_key;
        for (key, bytes) in children {
            let Some(parsed) = parse_key(&key) else {
                log::warn!("{}: skipping non-numeric change key {key}", self.doc_id);
                continue;
            };
            if parsed != expected {
                log::warn!(
                    "{}: gap in change log, expected key {expected} but found {parsed}",
                    self.doc_id
                );
                break;
            }
            records.push(LogRecord::decode(parsed, &bytes));
            expected += 1;
        }
        Ok(records)
    }

    /// One conditional write at `latest_key + 1`.
    pub async fn try_append(
        &mut self,
        steps: Vec<Step>,
        meta: Meta,
    ) -> Result<AppendAttempt, SyncError> {
        let key = self.latest_key + 1;
        let entry = ChangeEntry {
            key,
            steps,
            client_id: self.client_id.clone(),
            meta,
            timestamp: now_millis(),
        };
        let bytes = entry.encode()?;
        let outcome = self
            .store
            .conditional_write(&change_path(&self.doc_id, key), move |current| {
                current.is_none().then_some(bytes)
            })
            .await?;

        if outcome.committed {
            self.latest_key = key;
            return Ok(AppendAttempt::Committed(entry));
        }
        let Some(winner) = outcome.value else {
            let reason = format!("conditional write at key {key} aborted");
            return Err(StoreError::Database(reason).into());
        };
        self.latest_key = key;
        Ok(AppendAttempt::Conflict(LogRecord::decode(key, &winner)))
    }

    /// Appends `steps` as one entry, retrying at the next slot after every
    /// lost race. `rebuild` receives each winner and returns the steps to
    /// try next.
    pub async fn append_entry<F>(
        &mut self,
        steps: Vec<Step>,
        meta: Meta,
        mut rebuild: F,
    ) -> Result<AppendOutcome, SyncError>
    where
        F: FnMut(&LogRecord) -> Result<Vec<Step>, SyncError>,
    {
        let mut steps = steps;
        let mut attempts = 0;
        loop {
            if steps.is_empty() {
                return Ok(AppendOutcome::Emptied { attempts });
            }
            if attempts >= self.max_attempts {
                return Err(SyncError::AppendConflict {
                    key: self.latest_key + 1,
                    attempts,
                });
            }
            attempts += 1;
            match self.try_append(steps, meta.clone()).await? {
                AppendAttempt::Committed(entry) => {
                    log::debug!(
                        "{}: appended {} steps at key {} after {attempts} attempt(s)",
                        self.doc_id,
                        entry.steps.len(),
                        entry.key
                    );
                    return Ok(AppendOutcome::Committed { entry, attempts });
                }
                AppendAttempt::Conflict(winner) => {
                    log::debug!("{}: lost key {}, rebuilding", self.doc_id, winner.key());
                    steps = rebuild(&winner)?;
                }
            }
        }
    }

    /// Live feed of entries with key `>= from_key`. Existing entries are
    /// delivered first.
    pub async fn subscribe(&self, from_key: u64) -> Result<ChangeSubscription, SyncError> {
        let inner = self
            .store
            .subscribe(&changes_prefix(&self.doc_id), Some(&change_key(from_key)))
            .await?;
        Ok(ChangeSubscription { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStore;
    use quire_core::{rebase_steps, Document};

    fn client(store: &Arc<MemoryLogStore>, id: &str) -> ChangeLogClient<MemoryLogStore> {
        ChangeLogClient::new(Arc::clone(store), "doc", id, &EngineConfig::for_testing())
    }

    #[tokio::test]
    async fn test_append_claims_next_key() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = client(&store, "a");
        let outcome = a
            .append_entry(vec![Step::insert_text(1, "hi")], Meta::new(), |_| Ok(Vec::new()))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AppendOutcome::Committed { ref entry, attempts: 1 } if entry.key == 1
        ));
        assert_eq!(a.latest_key(), 1);
    }

    #[tokio::test]
    async fn test_conflict_advances_and_rebases() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = client(&store, "a");
        let mut b = client(&store, "b");

        a.try_append(vec![Step::insert_text(1, "hello")], Meta::new())
            .await
            .unwrap();

        // b still believes the log is empty.
        let mut current = vec![Step::insert_text(1, "world")];
        let outcome = b
            .append_entry(current.clone(), Meta::new(), |winner| {
                let over = &winner.entry().unwrap().steps;
                current = rebase_steps(&current, over).steps;
                Ok(current.clone())
            })
            .await
            .unwrap();
        let AppendOutcome::Committed { entry, attempts } = outcome else {
            panic!("expected commit");
        };
        assert_eq!(attempts, 2);
        assert_eq!(entry.key, 2);
        assert_eq!(entry.steps, vec![Step::insert_text(6, "world")]);
    }

    #[tokio::test]
    async fn test_try_append_conflict_has_no_side_effects() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = client(&store, "a");
        let mut b = client(&store, "b");
        a.try_append(vec![Step::insert_text(1, "x")], Meta::new()).await.unwrap();

        let attempt = b.try_append(vec![Step::insert_text(1, "y")], Meta::new()).await.unwrap();
        let AppendAttempt::Conflict(LogRecord::Entry(winner)) = attempt else {
            panic!("expected conflict");
        };
        assert_eq!(winner.client_id, "a");
        assert_eq!(b.latest_key(), 1);
        assert_eq!(a.load_entries(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_gives_up_after_max_attempts() {
        let store = Arc::new(MemoryLogStore::new());
        let mut writer = client(&store, "w");
        for i in 0..20 {
            writer
                .try_append(vec![Step::insert_text(1, &i.to_string())], Meta::new())
                .await
                .unwrap();
        }
        let mut late = client(&store, "late");
        let err = late
            .append_entry(vec![Step::insert_text(1, "z")], Meta::new(), |_| {
                Ok(vec![Step::insert_text(1, "z")])
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AppendConflict { attempts: 8, .. }));
    }

    #[tokio::test]
    async fn test_rebuild_to_empty_writes_nothing() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = client(&store, "a");
        let mut b = client(&store, "b");
        a.try_append(vec![Step::insert_text(1, "x")], Meta::new()).await.unwrap();

        let outcome = b
            .append_entry(vec![Step::insert_text(1, "y")], Meta::new(), |_| Ok(Vec::new()))
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Emptied { attempts: 1 });
        assert_eq!(b.load_entries(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_entries_stops_at_gap() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = client(&store, "a");
        for _ in 0..3 {
            a.try_append(vec![Step::insert_text(1, "a")], Meta::new()).await.unwrap();
        }
        store.remove(&change_path("doc", 2)).await.unwrap();

        let keys: Vec<u64> = a.load_entries(1).await.unwrap().iter().map(LogRecord::key).collect();
        assert_eq!(keys, vec![1]);
        let keys: Vec<u64> = a.load_entries(3).await.unwrap().iter().map(LogRecord::key).collect();
        assert_eq!(keys, vec![3]);
    }

    #[tokio::test]
    async fn test_undecodable_slot_is_reported() {
        let store = Arc::new(MemoryLogStore::new());
        store
            .conditional_write(&change_path("doc", 1), |_| Some(vec![0xde, 0xad]))
            .await
            .unwrap();
        let a = client(&store, "a");
        let records = a.load_entries(1).await.unwrap();
        assert!(matches!(records.as_slice(), [LogRecord::Undecodable { key: 1, .. }]));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint() {
        let store = Arc::new(MemoryLogStore::new());
        let a = client(&store, "a");
        assert!(a.load_checkpoint().await.unwrap().is_none());

        store.write(&checkpoint_path("doc"), vec![1, 2, 3]).await.unwrap();
        assert!(matches!(
            a.load_checkpoint().await,
            Err(SyncError::CorruptCheckpoint(_))
        ));

        let checkpoint = Checkpoint {
            key: 100,
            snapshot: Document::from_paragraphs(&["saved"]),
            timestamp: 1,
        };
        store
            .write(&checkpoint_path("doc"), checkpoint.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(a.load_checkpoint().await.unwrap(), Some(checkpoint));
    }

    #[tokio::test]
    async fn test_subscribe_sees_backlog_then_new_entries() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = client(&store, "a");
        a.try_append(vec![Step::insert_text(1, "1")], Meta::new()).await.unwrap();
        a.try_append(vec![Step::insert_text(1, "2")], Meta::new()).await.unwrap();

        let mut sub = a.subscribe(2).await.unwrap();
        a.try_append(vec![Step::insert_text(1, "3")], Meta::new()).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().key(), 2);
        assert_eq!(sub.recv().await.unwrap().key(), 3);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_surfaces() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = client(&store, "a");
        store.set_available(false);
        let err = a
            .try_append(vec![Step::insert_text(1, "x")], Meta::new())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(a.latest_key(), 0);
    }
}

//! In-memory log store.
//!
//! Shared by every client of a test or demo through `Arc`. An availability
//! switch simulates outages, and `drop_connection` runs the disconnect
//! cleanups a real store would run when a client's socket closes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::RwLock;

use super::{
    direct_child, split_path, ChangeFeed, FeedEvent, LogStore, StoreError, Subscription,
    WriteOutcome,
};

#[derive(Debug)]
pub struct MemoryLogStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    feed: ChangeFeed,
    available: AtomicBool,
    cleanups: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            feed: ChangeFeed::new(),
            available: AtomicBool::new(true),
            cleanups: Mutex::new(HashMap::new()),
        }
    }

    /// Takes the store offline (`false`) or back online (`true`).
    pub fn set_available(&self, available: bool) {
        log::info!(
            "memory store {}",
            if available { "online" } else { "offline" }
        );
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Runs every cleanup registered for `connection`. Returns the number of
    /// paths removed.
    pub async fn drop_connection(&self, connection: &str) -> usize {
        let paths = self
            .cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection)
            .unwrap_or_default();
        let mut data = self.data.write().await;
        let mut removed = 0;
        for path in paths {
            if remove_locked(&mut data, &self.feed, &path) {
                removed += 1;
            }
        }
        log::debug!("connection {connection} dropped, {removed} paths cleaned up");
        removed
    }

    /// Number of stored paths.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

fn children(
    data: &BTreeMap<String, Vec<u8>>,
    prefix: &str,
    from_key: Option<&str>,
) -> Vec<(String, Vec<u8>)> {
    let dir = format!("{prefix}/");
    let start = format!("{dir}{}", from_key.unwrap_or(""));
    data.range(start..)
        .take_while(|(path, _)| path.starts_with(&dir))
        .filter_map(|(path, value)| {
            direct_child(prefix, path).map(|key| (key.to_string(), value.clone()))
        })
        .collect()
}

fn put_locked(data: &mut BTreeMap<String, Vec<u8>>, feed: &ChangeFeed, path: &str, value: Vec<u8>) {
    let existed = data.insert(path.to_string(), value.clone()).is_some();
    if let Ok((parent, key)) = split_path(path) {
        let key = key.to_string();
        let event = if existed {
            FeedEvent::Changed { key, value }
        } else {
            FeedEvent::Added { key, value }
        };
        feed.publish(parent, event);
    }
}

fn remove_locked(data: &mut BTreeMap<String, Vec<u8>>, feed: &ChangeFeed, path: &str) -> bool {
    if data.remove(path).is_none() {
        return false;
    }
    if let Ok((parent, key)) = split_path(path) {
        feed.publish(parent, FeedEvent::Removed { key: key.to_string() });
    }
    true
}

impl LogStore for MemoryLogStore {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        Ok(self.data.read().await.get(path).cloned())
    }

    async fn conditional_write<F>(&self, path: &str, update: F) -> Result<WriteOutcome, StoreError>
    where
        F: FnOnce(Option<&[u8]>) -> Option<Vec<u8>> + Send,
    {
        self.check()?;
        let (_, key) = split_path(path)?;
        let key = key.to_string();
        let mut data = self.data.write().await;
        let current = data.get(path).cloned();
        let proposed = update(current.as_deref());

        match (current, proposed) {
            (None, Some(value)) => {
                put_locked(&mut data, &self.feed, path, value.clone());
                Ok(WriteOutcome {
                    committed: true,
                    value: Some(value),
                    key,
                })
            }
            (current, _) => Ok(WriteOutcome {
                committed: false,
                value: current,
                key,
            }),
        }
    }

    async fn write(&self, path: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check()?;
        split_path(path)?;
        let mut data = self.data.write().await;
        put_locked(&mut data, &self.feed, path, value);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut data = self.data.write().await;
        remove_locked(&mut data, &self.feed, path);
        Ok(())
    }

    async fn read_children(
        &self,
        prefix: &str,
        from_key: Option<&str>,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.check()?;
        Ok(children(&*self.data.read().await, prefix, from_key))
    }

    async fn subscribe(
        &self,
        prefix: &str,
        from_key: Option<&str>,
    ) -> Result<Subscription, StoreError> {
        self.check()?;
        // Held across snapshot + registration so no write slips between them.
        let data = self.data.read().await;
        let initial = children(&data, prefix, from_key)
            .into_iter()
            .map(|(key, value)| FeedEvent::Added { key, value })
            .collect();
        Ok(self.feed.subscribe(prefix, initial))
    }

    async fn on_disconnect_cleanup(&self, connection: &str, path: &str) -> Result<(), StoreError> {
        self.check()?;
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(connection.to_string())
            .or_default()
            .insert(path.to_string());
        Ok(())
    }
}

//! Fan-out of child events to subscribers, grouped by parent prefix.
//!
//! Each subscription owns an unbounded mpsc receiver, so a slow consumer
//! never blocks writers. Closed receivers are pruned on the next publish.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::{FeedEvent, Subscription};

#[derive(Debug, Default)]
pub struct ChangeFeed {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<FeedEvent>>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<mpsc::UnboundedSender<FeedEvent>>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber under `prefix`. `initial` events are queued
    /// ahead of any live event.
    pub fn subscribe(&self, prefix: &str, initial: Vec<FeedEvent>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in initial {
            // The receiver is alive in this scope.
            let _ = tx.send(event);
        }
        self.lock().entry(prefix.to_string()).or_default().push(tx);
        log::trace!("feed: new subscriber on {prefix}");
        Subscription::new(prefix, rx)
    }

    /// Sends `event` to every live subscriber of `prefix`. Returns how many
    /// received it.
    pub fn publish(&self, prefix: &str, event: FeedEvent) -> usize {
        let mut subscribers = self.lock();
        let Some(senders) = subscribers.get_mut(prefix) else {
            return 0;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            subscribers.remove(prefix);
        }
        log::trace!("feed: {prefix}/{} -> {delivered} subscribers", event.key());
        delivered
    }

    pub fn subscriber_count(&self, prefix: &str) -> usize {
        self.lock().get(prefix).map_or(0, Vec::len)
    }
}

//! Local edits that have not reached the log yet.
//!
//! Edits wait here while an append is in flight or the store is
//! unreachable. They are kept in submission order and rebased in place
//! whenever a remote entry lands underneath them.

use std::collections::VecDeque;

use quire_core::Step;

use crate::codec::Meta;

/// One submitted local transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    pub steps: Vec<Step>,
    pub meta: Meta,
}

/// Bounded FIFO of pending edits.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    queue: VecDeque<PendingEdit>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an edit. Returns `false` when the queue is full.
    pub fn enqueue(&mut self, edit: PendingEdit) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(edit);
        true
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEdit> {
        self.queue.iter()
    }

    /// Every queued step, oldest edit first.
    pub fn steps(&self) -> Vec<Step> {
        self.queue.iter().flat_map(|e| e.steps.iter().cloned()).collect()
    }

    pub fn total_steps(&self) -> usize {
        self.queue.iter().map(|e| e.steps.len()).sum()
    }

    /// Meta of all queued edits; later edits win on key collisions.
    pub fn merged_meta(&self) -> Meta {
        let mut meta = Meta::new();
        for edit in &self.queue {
            meta.extend(edit.meta.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        meta
    }

    /// Replaces the queued steps with `steps`, which must hold one entry per
    /// current step in order (`None` for a step that no longer exists).
    /// Edits left without steps are removed.
    pub fn redistribute(&mut self, steps: Vec<Option<Step>>) {
        let mut steps = steps.into_iter();
        for edit in self.queue.iter_mut() {
            let count = edit.steps.len();
            edit.steps = steps.by_ref().take(count).flatten().collect();
        }
        self.queue.retain(|e| !e.steps.is_empty());
    }

    /// Keeps only the steps `keep` accepts, in order.
    pub fn retain_steps(&mut self, mut keep: impl FnMut(&Step) -> bool) {
        for edit in self.queue.iter_mut() {
            edit.steps.retain(&mut keep);
        }
        self.queue.retain(|e| !e.steps.is_empty());
    }

    /// Collapses the queue into a single edit.
    pub fn replace_all(&mut self, steps: Vec<Step>, meta: Meta) {
        self.queue.clear();
        if !steps.is_empty() {
            self.queue.push_back(PendingEdit { steps, meta });
        }
    }
}

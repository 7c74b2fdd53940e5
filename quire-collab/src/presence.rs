//! Selection awareness: where every other client's cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local pointer selection
//!       │
//!       ▼
//! SelectionTracker::set_local_selection()
//!       │  (skipped unless range or activity bucket changed)
//!       ▼
//! SelectionRecord ──write──► D/selections/{client}   (+ disconnect cleanup)
//!                                   │
//!                                   ▼  (Subscription)
//! Remote SelectionTracker::handle_feed_event()  (clamped, latest write wins)
//!       │
//!       ▼
//! remap() on every document change, sweep() for idle clients
//! ```
//!
//! Only pointer-driven selections are broadcast. Selections that move
//! because a remote edit shifted the text are remapped locally on every
//! client, so echoing them would only bounce updates back and forth.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::collections::HashMap;
use std::time::Duration;

use quire_core::{Assoc, Mapping};
use serde::{Deserialize, Serialize};

use crate::codec::{decode, SelectionDisplay, SelectionRecord};
use crate::config::EngineConfig;
use crate::storage::FeedEvent;

// ───────────────────────────────────────────────────────────────────
// Display color
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable hue in degrees for a client id: the sum of its character
    /// codes modulo 360.
    pub fn hue_for(client_id: &str) -> u32 {
        client_id
            .chars()
            .fold(0u32, |acc, c| acc.wrapping_add(c as u32))
            % 360
    }

    /// Fully saturated, half-lightness color for `hue` degrees.
    pub fn from_hue(hue: u32) -> Self {
        let (r, g, b) = hsl_to_rgb((hue % 360) as f32 / 360.0, 1.0, 0.5);
        Self { r, g, b, a: 1.0 }
    }

    pub fn from_client_id(client_id: &str) -> Self {
        Self::from_hue(Self::hue_for(client_id))
    }

    /// Same color with a different alpha, e.g. for selection highlights.
    pub fn with_alpha(self, a: f32) -> Self {
        Self { a, ..self }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// What moved the local selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionIntent {
    /// Mouse or keyboard; broadcast to other clients.
    Pointer,
    /// Moved by code, e.g. after applying a remote change. Kept local.
    Programmatic,
}

/// Another client's selection as this client sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSelection {
    pub client_id: String,
    pub anchor: usize,
    pub head: usize,
    pub color: CursorColor,
    pub last_active: u64,
    /// Log key of the document the positions were taken against.
    pub version: u64,
}

impl RemoteSelection {
    pub fn from_record(record: SelectionRecord, doc_size: usize) -> Self {
        Self {
            anchor: record.anchor.min(doc_size),
            head: record.head.min(doc_size),
            color: CursorColor::from_hue(record.display.color_seed),
            last_active: record.display.last_active,
            version: record.version,
            client_id: record.client_id,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Broadcast {
    anchor: usize,
    head: usize,
    bucket: u64,
}

/// Tracks the local selection and every remote one for a document.
#[derive(Debug)]
pub struct SelectionTracker {
    client_id: String,
    remote: HashMap<String, RemoteSelection>,
    local: Option<(usize, usize)>,
    last_broadcast: Option<Broadcast>,
    bucket_ms: u64,
    timeout_ms: u64,
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

impl SelectionTracker {
    pub fn new(client_id: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            client_id: client_id.into(),
            remote: HashMap::new(),
            local: None,
            last_broadcast: None,
            bucket_ms: millis(config.activity_bucket),
            timeout_ms: millis(config.selection_timeout),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn local_selection(&self) -> Option<(usize, usize)> {
        self.local
    }

    fn bucket(&self, now_ms: u64) -> u64 {
        if self.bucket_ms == 0 {
            now_ms
        } else {
            now_ms - now_ms % self.bucket_ms
        }
    }

    /// Updates the local selection, taken against the document at log key
    /// `doc_version`. Returns the record to publish, or `None` when nothing
    /// needs to go out.
    pub fn set_local_selection(
        &mut self,
        anchor: usize,
        head: usize,
        intent: SelectionIntent,
        doc_version: u64,
        now_ms: u64,
    ) -> Option<SelectionRecord> {
        self.local = Some((anchor, head));
        if intent != SelectionIntent::Pointer {
            return None;
        }

        let next = Broadcast {
            anchor,
            head,
            bucket: self.bucket(now_ms),
        };
        if self.last_broadcast == Some(next) {
            return None;
        }
        self.last_broadcast = Some(next);

        Some(SelectionRecord {
            client_id: self.client_id.clone(),
            anchor,
            head,
            display: SelectionDisplay {
                color_seed: CursorColor::hue_for(&self.client_id),
                last_active: next.bucket,
            },
            version: doc_version,
        })
    }

    /// Applies one event from the selections feed. Returns whether the set
    /// of remote selections changed.
    ///
    /// Each client writes only its own slot and the feed delivers writes to
    /// a slot in order, so the newest event always replaces what is held.
    pub fn handle_feed_event(&mut self, event: FeedEvent, doc_size: usize) -> bool {
        match event {
            FeedEvent::Added { key, value } | FeedEvent::Changed { key, value } => {
                if key == self.client_id {
                    return false;
                }
                match decode::<SelectionRecord>(&value) {
                    Ok(record) => {
                        let selection = RemoteSelection::from_record(record, doc_size);
                        self.remote.insert(key, selection);
                        true
                    }
                    Err(e) => {
                        log::warn!("ignoring undecodable selection from {key}: {e}");
                        false
                    }
                }
            }
            FeedEvent::Removed { key } => self.remote.remove(&key).is_some(),
        }
    }

    /// Moves every tracked selection through a document change.
    pub fn remap(&mut self, mapping: &Mapping) {
        if mapping.is_empty() {
            return;
        }
        for selection in self.remote.values_mut() {
            selection.anchor = mapping.map(selection.anchor, Assoc::After);
            selection.head = mapping.map(selection.head, Assoc::After);
        }
        if let Some((anchor, head)) = self.local {
            self.local = Some((
                mapping.map(anchor, Assoc::After),
                mapping.map(head, Assoc::After),
            ));
        }
    }

    /// Clamps every remote selection to a document of `doc_size`.
    pub fn clamp(&mut self, doc_size: usize) {
        for selection in self.remote.values_mut() {
            selection.anchor = selection.anchor.min(doc_size);
            selection.head = selection.head.min(doc_size);
        }
    }

    /// Evicts remote selections idle longer than the timeout. Returns the
    /// evicted client ids.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<String> {
        let timeout = self.timeout_ms;
        let stale: Vec<String> = self
            .remote
            .iter()
            .filter(|(_, s)| now_ms.saturating_sub(s.last_active) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.remote.remove(id);
            log::debug!("selection of {id} expired");
        }
        stale
    }

    /// Remote selections ordered by client id.
    pub fn active_selections(&self) -> Vec<RemoteSelection> {
        let mut selections: Vec<RemoteSelection> = self.remote.values().cloned().collect();
        selections.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        selections
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }
}

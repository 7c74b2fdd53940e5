//! Wire records stored in the log.
//!
//! Wire format (bincode, standard config):
//! ```text
//! ChangeEntry   ┌─────┬──────────────────────┬───────────┬──────┬───────────┐
//!               │ key │ steps (LZ4 ▸ bincode) │ client_id │ meta │ timestamp │
//!               └─────┴──────────────────────┴───────────┴──────┴───────────┘
//! Checkpoint    ┌─────┬─────────────────────────┬───────────┐
//!               │ key │ snapshot (LZ4 ▸ bincode) │ timestamp │
//!               └─────┴─────────────────────────┴───────────┘
//! ```
//!
//! Step lists and snapshots are LZ4 block-compressed with the original size
//! prepended; selection, fork and commit bookkeeping records are plain
//! bincode.
//!
//! Reference: Patterson & Hennessy — Section 5.7 (Data Compression)

use std::collections::BTreeMap;
use std::time::SystemTime;

use quire_core::{Document, Step};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    Ok(value)
}

fn compress<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(lz4_flex::compress_prepend_size(&encode(value)?))
}

fn decompress<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    decode(&raw)
}

pub fn encode_steps(steps: &[Step]) -> Result<Vec<u8>, CodecError> {
    compress(&steps)
}

pub fn decode_steps(bytes: &[u8]) -> Result<Vec<Step>, CodecError> {
    decompress(bytes)
}

pub fn encode_snapshot(doc: &Document) -> Result<Vec<u8>, CodecError> {
    compress(doc)
}

/// Decoding validates the document, so a structurally broken snapshot fails
/// here rather than at first use.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Document, CodecError> {
    decompress(bytes)
}

// ─── Change entries ─────────────────────────────────────────────────────────

/// Free-form metadata attached to an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

pub type Meta = BTreeMap<String, MetaValue>;

/// Meta key set on entries produced by a fork rebase.
pub const META_REBASED: &str = "rebased";
/// Meta key naming the fork a rebased entry came from.
pub const META_FORK: &str = "fork";
/// Meta key naming the commit a commit-level rebase moved.
pub const META_COMMIT: &str = "commit";

/// One committed batch of steps at a log key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub key: u64,
    pub steps: Vec<Step>,
    pub client_id: String,
    pub meta: Meta,
    pub timestamp: u64,
}

#[derive(Serialize, Deserialize)]
struct WireChange {
    key: u64,
    steps: Vec<u8>,
    client_id: String,
    meta: Meta,
    timestamp: u64,
}

impl ChangeEntry {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(&WireChange {
            key: self.key,
            steps: encode_steps(&self.steps)?,
            client_id: self.client_id.clone(),
            meta: self.meta.clone(),
            timestamp: self.timestamp,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: WireChange = decode(bytes)?;
        Ok(Self {
            key: wire.key,
            steps: decode_steps(&wire.steps)?,
            client_id: wire.client_id,
            meta: wire.meta,
            timestamp: wire.timestamp,
        })
    }

    pub fn is_rebased(&self) -> bool {
        matches!(self.meta.get(META_REBASED), Some(MetaValue::Bool(true)))
    }
}

// ─── Checkpoints ────────────────────────────────────────────────────────────

/// Snapshot of the document after entry `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub key: u64,
    pub snapshot: Document,
    pub timestamp: u64,
}

#[derive(Serialize, Deserialize)]
struct WireCheckpoint {
    key: u64,
    snapshot: Vec<u8>,
    timestamp: u64,
}

impl Checkpoint {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(&WireCheckpoint {
            key: self.key,
            snapshot: encode_snapshot(&self.snapshot)?,
            timestamp: self.timestamp,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: WireCheckpoint = decode(bytes)?;
        Ok(Self {
            key: wire.key,
            snapshot: decode_snapshot(&wire.snapshot)?,
            timestamp: wire.timestamp,
        })
    }
}

// ─── Selections ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionDisplay {
    /// Hue in degrees, derived from the client id.
    pub color_seed: u32,
    /// Milliseconds, rounded down to the activity bucket.
    pub last_active: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub client_id: String,
    pub anchor: usize,
    pub head: usize,
    pub display: SelectionDisplay,
    /// Log key the positions were taken against.
    pub version: u64,
}

// ─── Forks & commits ────────────────────────────────────────────────────────

/// Stored at `{fork}/fork_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkRecord {
    pub fork_id: String,
    pub parent_id: String,
    pub forked_at_key: u64,
    pub merged: bool,
    pub created_at: u64,
    pub merged_at: Option<u64>,
}

/// Stored on the parent at `{parent}/forks/{fork}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkMarker {
    pub fork_id: String,
    pub forked_at_key: u64,
    pub created_at: u64,
}

/// A named bundle of the steps committed since the previous commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub commit_id: u64,
    pub description: String,
    pub steps: Vec<Step>,
    pub client_id: String,
    /// First and last log key covered; `first > last` for an empty commit.
    pub key_range: (u64, u64),
    pub merged: bool,
    pub created_at: u64,
}

#[derive(Serialize, Deserialize)]
struct WireCommit {
    commit_id: u64,
    description: String,
    steps: Vec<u8>,
    client_id: String,
    key_range: (u64, u64),
    merged: bool,
    created_at: u64,
}

impl CommitRecord {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(&WireCommit {
            commit_id: self.commit_id,
            description: self.description.clone(),
            steps: encode_steps(&self.steps)?,
            client_id: self.client_id.clone(),
            key_range: self.key_range,
            merged: self.merged,
            created_at: self.created_at,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: WireCommit = decode(bytes)?;
        Ok(Self {
            commit_id: wire.commit_id,
            description: wire.description,
            steps: decode_steps(&wire.steps)?,
            client_id: wire.client_id,
            key_range: wire.key_range,
            merged: wire.merged,
            created_at: wire.created_at,
        })
    }
}

/// The open commit window: the next id to allocate and the last key the
/// previous commit covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentCommit {
    pub commit_id: u64,
    pub started_after_key: u64,
}

//! Engine configuration.

use std::time::Duration;

/// Tunables for one sync engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Write a checkpoint every N accepted entries (default: 100)
    pub checkpoint_interval: u64,
    /// Remote selections idle longer than this are evicted (default: 10 min)
    pub selection_timeout: Duration,
    /// `last_active` is rounded down to this bucket before broadcasting (default: 60s)
    pub activity_bucket: Duration,
    /// How often stale selections are swept (default: 30s)
    pub sweep_interval: Duration,
    /// Conditional-write attempts before an append gives up (default: 64)
    pub max_append_attempts: u32,
    /// Local edits held while the store is unreachable (default: 10,000)
    pub offline_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 100,
            selection_timeout: Duration::from_secs(10 * 60),
            activity_bucket: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            max_append_attempts: 64,
            offline_queue_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    /// Small limits and fast timers for tests.
    pub fn for_testing() -> Self {
        Self {
            checkpoint_interval: 100,
            selection_timeout: Duration::from_secs(10 * 60),
            activity_bucket: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(50),
            max_append_attempts: 8,
            offline_queue_capacity: 64,
        }
    }
}

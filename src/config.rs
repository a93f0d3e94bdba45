//! Centralized tunables for the mesh core.
//!
//! A host app may load overrides from TOML/JSON at startup and pass a single
//! [`MeshConfig`] down through construction rather than recompiling; defaults
//! match the literal values called out across the design.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Hop budget ceiling stamped on freshly built packets.
    pub max_ttl: u8,
    /// Max entries retained in the dedup cache before LRU eviction.
    pub dedup_cache_cap: usize,
    /// Age at which a dedup entry is considered stale even if not evicted.
    pub dedup_entry_ttl: Duration,
    /// Packets stamped further than this into the future are rejected.
    pub max_clock_skew: Duration,
    /// Max entries retained in the trusted-peer LRU set.
    pub trusted_peer_cap: usize,
    /// Coalescing window before queued read receipts are flushed.
    pub receipt_coalesce_window: Duration,
    /// Max receipt entries packed into a single batch ack.
    pub max_batch_receipt_count: usize,
    /// Max messages retained in-memory per chat/emergency repository.
    pub chat_message_cap: usize,
    /// Number of independent re-encrypt-and-broadcast passes per alert.
    pub emergency_rebroadcast_count: u8,
    /// Max alerts retained in-memory by the emergency repository.
    pub emergency_alert_cap: usize,
    /// Max retry attempts for a failed emergency send before giving up.
    pub max_retries: u32,
    /// Debounce window before pending store writes are flushed to disk.
    pub store_debounce_window: Duration,
    /// Interval between automatic location broadcasts while broadcasting is
    /// enabled and location permission is granted.
    pub location_broadcast_interval: Duration,
    /// Flush immediately once this many writes are outstanding.
    pub store_flush_threshold: usize,
    /// Argon2id parameters for group key derivation.
    pub argon2_params: Argon2Params,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Argon2Params {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            mem_cost_kib: 131_072, // 128 MiB
            time_cost: 3,
            parallelism: 1,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_ttl: 7,
            dedup_cache_cap: 2000,
            dedup_entry_ttl: Duration::from_secs(5 * 60),
            max_clock_skew: Duration::from_secs(5 * 60),
            trusted_peer_cap: 500,
            receipt_coalesce_window: Duration::from_secs(2),
            max_batch_receipt_count: 11, // 41B entries must fit 512B payload minus sentinel+count
            chat_message_cap: 200,
            emergency_rebroadcast_count: 3,
            emergency_alert_cap: 200,
            max_retries: 5,
            store_debounce_window: Duration::from_secs(5),
            location_broadcast_interval: Duration::from_secs(30),
            store_flush_threshold: 10,
            argon2_params: Argon2Params::default(),
        }
    }
}

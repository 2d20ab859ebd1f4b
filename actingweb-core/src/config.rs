//! Ambient configuration for the engine.
//!
//! Plain serde data, not a `clap::Parser` — the spec excludes CLI tooling,
//! but embedders still need to load these tunables from their own config
//! file or environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connect/read timeout budget applied to every peer HTTP call. Default
/// mirrors the original's `timeout=(5, 10)` convention used throughout
/// `actor.py`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutBudget {
    pub connect_ms: u64,
    pub read_ms: u64,
}

impl Default for TimeoutBudget {
    fn default() -> Self {
        TimeoutBudget {
            connect_ms: 5_000,
            read_ms: 10_000,
        }
    }
}

impl TimeoutBudget {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn total(&self) -> Duration {
        self.connect() + self.read()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Block the emitting task on every outbound callback (serverless mode).
    /// See spec §5.
    pub sync_subscription_callbacks: bool,

    /// Seconds of staleness on the oldest pending callback before a gap is
    /// promoted to a resync requirement. Spec §4.4.2, default 5.0.
    pub gap_timeout_seconds: f64,

    /// Maximum queued out-of-order callbacks per subscription before
    /// `REJECTED` is returned (back-pressure).
    pub max_pending: usize,

    /// Retry attempts for the callback processor's optimistic-lock loop.
    pub max_retries: u32,

    /// Base delay for the optimistic-lock retry backoff:
    /// `retry_backoff_base_ms * 2^attempt`.
    pub retry_backoff_base_ms: u64,

    /// Timeout budget for peer HTTP calls (trust, subscriptions, sync).
    pub peer_timeout: TimeoutBudget,

    /// Retry cap for `GET /meta` during trust establishment. Network errors
    /// are retried this many times with exponential backoff; parse errors
    /// are not retried.
    pub meta_fetch_max_retries: u32,

    /// Base delay for the meta-fetch retry backoff, in milliseconds.
    pub meta_fetch_retry_delay_ms: u64,

    /// Enable auto-storage: inbound callback/resync data is mirrored into
    /// the `remote:<peer_id>` attribute bucket (spec §4.6).
    pub auto_storage: bool,

    /// TTL, in seconds, for the peer profile/capabilities/permissions caches.
    pub peer_cache_ttl_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sync_subscription_callbacks: false,
            gap_timeout_seconds: 5.0,
            max_pending: 100,
            max_retries: 3,
            retry_backoff_base_ms: 500,
            peer_timeout: TimeoutBudget::default(),
            meta_fetch_max_retries: 3,
            meta_fetch_retry_delay_ms: 500,
            auto_storage: true,
            peer_cache_ttl_seconds: 300,
        }
    }
}

//! Storage abstraction (spec §1, §6, §9).
//!
//! Persistence itself is out of scope for the engine; every component is
//! written against the [`StorageAdapter`] trait. [`memory`] provides a
//! reference implementation used by tests and by embedders that don't need
//! durability. `actingweb-storage-sqlite` is the durable implementation.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Attribute, Diff, Subscription, Trust};

/// Outcome of a conditional attribute write (spec §9: "conditional write for
/// optimistic locking").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Ok,
    /// The stored version didn't match `expected_version`; the caller should
    /// re-read and retry.
    Conflict,
}

/// Everything the engine needs to persist and look up (spec §6's layout):
/// actors are opaque to this trait (embedders own actor existence/lookup);
/// trusts, subscriptions, diffs and attributes are owned here.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    // -- trust -----------------------------------------------------------

    async fn get_trust(&self, actor_id: &str, peer_id: &str) -> Result<Option<Trust>>;

    async fn list_trusts(&self, actor_id: &str) -> Result<Vec<Trust>>;

    async fn put_trust(&self, trust: Trust) -> Result<()>;

    async fn delete_trust(&self, actor_id: &str, peer_id: &str) -> Result<()>;

    // -- subscriptions -----------------------------------------------------

    async fn get_subscription(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<Option<Subscription>>;

    async fn list_subscriptions(&self, actor_id: &str) -> Result<Vec<Subscription>>;

    async fn list_subscriptions_for_peer(
        &self,
        actor_id: &str,
        peer_id: &str,
    ) -> Result<Vec<Subscription>>;

    async fn put_subscription(&self, subscription: Subscription) -> Result<()>;

    async fn delete_subscription(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<()>;

    /// Atomically increment `subscription.sequence` and return the new
    /// value. Used by the outbound emitter before persisting a diff
    /// (spec §4.4.1 — sequence first, diff second, roll back on failure).
    async fn increment_sequence(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<u64>;

    /// Roll back a sequence bump when diff creation failed. Best-effort:
    /// the original also tolerates this failing silently.
    async fn decrement_sequence(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<()>;

    // -- diffs -------------------------------------------------------------

    async fn put_diff(&self, diff: Diff) -> Result<()>;

    /// Diffs for a subscription with `sequence > after_sequence`, ascending.
    async fn list_diffs_after(
        &self,
        actor_id: &str,
        subscription_id: &str,
        after_sequence: u64,
    ) -> Result<Vec<Diff>>;

    async fn clear_diffs(&self, actor_id: &str, subscription_id: &str) -> Result<()>;

    // -- attributes (generic bucket/name store) ----------------------------

    async fn get_attr(&self, actor_id: &str, bucket: &str, name: &str) -> Result<Option<Attribute>>;

    async fn list_bucket(&self, actor_id: &str, bucket: &str) -> Result<Vec<(String, Attribute)>>;

    /// Unconditional write, bumping `version` by one.
    async fn set_attr(
        &self,
        actor_id: &str,
        bucket: &str,
        name: &str,
        data: serde_json::Value,
    ) -> Result<()>;

    /// Conditional write used by the callback processor's optimistic-lock
    /// loop (spec §4.4.2, §5): succeeds only if the current version equals
    /// `expected_version`.
    async fn set_attr_if_version(
        &self,
        actor_id: &str,
        bucket: &str,
        name: &str,
        data: serde_json::Value,
        expected_version: u64,
    ) -> Result<WriteOutcome>;

    async fn delete_attr(&self, actor_id: &str, bucket: &str, name: &str) -> Result<()>;

    async fn delete_bucket(&self, actor_id: &str, bucket: &str) -> Result<()>;
}

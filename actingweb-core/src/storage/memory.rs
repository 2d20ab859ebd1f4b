//! In-memory [`StorageAdapter`] reference implementation.
//!
//! Not feature-gated: always available, for tests and for embedders that
//! don't need durability (mirrors the teacher's `abp-backend-mock`-style
//! in-memory backend being a first-class, always-built crate rather than a
//! test-only shim).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use super::{StorageAdapter, WriteOutcome};
use crate::error::Result;
use crate::types::{Attribute, Diff, Subscription, Trust};

type TrustKey = (String, String);
type SubscriptionKey = (String, String, String);
type AttrKey = (String, String, String);

#[derive(Default)]
struct Inner {
    trusts: HashMap<TrustKey, Trust>,
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    diffs: HashMap<(String, String), Vec<Diff>>,
    attrs: HashMap<AttrKey, Attribute>,
}

/// A process-local [`StorageAdapter`] guarded by a single `RwLock`. Good
/// enough for tests and single-process embedders; not suitable across
/// processes.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get_trust(&self, actor_id: &str, peer_id: &str) -> Result<Option<Trust>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .trusts
            .get(&(actor_id.to_string(), peer_id.to_string()))
            .cloned())
    }

    async fn list_trusts(&self, actor_id: &str) -> Result<Vec<Trust>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .trusts
            .values()
            .filter(|t| t.actor_id == actor_id)
            .cloned()
            .collect())
    }

    async fn put_trust(&self, trust: Trust) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .trusts
            .insert((trust.actor_id.clone(), trust.peer_id.clone()), trust);
        Ok(())
    }

    async fn delete_trust(&self, actor_id: &str, peer_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .trusts
            .remove(&(actor_id.to_string(), peer_id.to_string()));
        Ok(())
    }

    async fn get_subscription(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .subscriptions
            .get(&(
                actor_id.to_string(),
                peer_id.to_string(),
                subscription_id.to_string(),
            ))
            .cloned())
    }

    async fn list_subscriptions(&self, actor_id: &str) -> Result<Vec<Subscription>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| s.actor_id == actor_id)
            .cloned()
            .collect())
    }

    async fn list_subscriptions_for_peer(
        &self,
        actor_id: &str,
        peer_id: &str,
    ) -> Result<Vec<Subscription>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| s.actor_id == actor_id && s.peer_id == peer_id)
            .cloned()
            .collect())
    }

    async fn put_subscription(&self, subscription: Subscription) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.subscriptions.insert(
            (
                subscription.actor_id.clone(),
                subscription.peer_id.clone(),
                subscription.subscription_id.clone(),
            ),
            subscription,
        );
        Ok(())
    }

    async fn delete_subscription(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.subscriptions.remove(&(
            actor_id.to_string(),
            peer_id.to_string(),
            subscription_id.to_string(),
        ));
        inner
            .diffs
            .remove(&(actor_id.to_string(), subscription_id.to_string()));
        Ok(())
    }

    async fn increment_sequence(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let key = (
            actor_id.to_string(),
            peer_id.to_string(),
            subscription_id.to_string(),
        );
        let sub = inner.subscriptions.get_mut(&key).ok_or_else(|| {
            crate::error::ActingWebError::SubscriptionSequencing(format!(
                "no such subscription: {subscription_id}"
            ))
        })?;
        sub.sequence += 1;
        Ok(sub.sequence)
    }

    async fn decrement_sequence(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let key = (
            actor_id.to_string(),
            peer_id.to_string(),
            subscription_id.to_string(),
        );
        if let Some(sub) = inner.subscriptions.get_mut(&key) {
            sub.sequence = sub.sequence.saturating_sub(1);
        }
        Ok(())
    }

    async fn put_diff(&self, diff: Diff) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .diffs
            .entry((diff.actor_id.clone(), diff.subscription_id.clone()))
            .or_default()
            .push(diff);
        Ok(())
    }

    async fn list_diffs_after(
        &self,
        actor_id: &str,
        subscription_id: &str,
        after_sequence: u64,
    ) -> Result<Vec<Diff>> {
        let inner = self.inner.read().unwrap();
        let mut diffs: Vec<Diff> = inner
            .diffs
            .get(&(actor_id.to_string(), subscription_id.to_string()))
            .map(|v| {
                v.iter()
                    .filter(|d| d.sequence > after_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        diffs.sort_by_key(|d| d.sequence);
        Ok(diffs)
    }

    async fn clear_diffs(&self, actor_id: &str, subscription_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .diffs
            .remove(&(actor_id.to_string(), subscription_id.to_string()));
        Ok(())
    }

    async fn get_attr(&self, actor_id: &str, bucket: &str, name: &str) -> Result<Option<Attribute>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .attrs
            .get(&(actor_id.to_string(), bucket.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_bucket(&self, actor_id: &str, bucket: &str) -> Result<Vec<(String, Attribute)>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .attrs
            .iter()
            .filter(|((a, b, _), _)| a == actor_id && b == bucket)
            .map(|((_, _, n), attr)| (n.clone(), attr.clone()))
            .collect())
    }

    async fn set_attr(
        &self,
        actor_id: &str,
        bucket: &str,
        name: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let key = (actor_id.to_string(), bucket.to_string(), name.to_string());
        let version = inner.attrs.get(&key).map(|a| a.version + 1).unwrap_or(1);
        inner.attrs.insert(
            key,
            Attribute {
                data,
                timestamp: Utc::now().to_rfc3339(),
                version,
            },
        );
        Ok(())
    }

    async fn set_attr_if_version(
        &self,
        actor_id: &str,
        bucket: &str,
        name: &str,
        data: serde_json::Value,
        expected_version: u64,
    ) -> Result<WriteOutcome> {
        let mut inner = self.inner.write().unwrap();
        let key = (actor_id.to_string(), bucket.to_string(), name.to_string());
        let current_version = inner.attrs.get(&key).map(|a| a.version).unwrap_or(0);
        if current_version != expected_version {
            return Ok(WriteOutcome::Conflict);
        }
        inner.attrs.insert(
            key,
            Attribute {
                data,
                timestamp: Utc::now().to_rfc3339(),
                version: current_version + 1,
            },
        );
        Ok(WriteOutcome::Ok)
    }

    async fn delete_attr(&self, actor_id: &str, bucket: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .attrs
            .remove(&(actor_id.to_string(), bucket.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete_bucket(&self, actor_id: &str, bucket: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .attrs
            .retain(|(a, b, _), _| !(a == actor_id && b == bucket));
        Ok(())
    }
}

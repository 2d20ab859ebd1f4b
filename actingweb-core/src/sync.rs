//! Pull-based sync reconciler (spec §4.5), grounded on the original
//! `subscription_manager.py`'s `sync_subscription` / `sync_peer`.
//!
//! Two entry points: [`SyncReconciler::sync_subscription`] catches up a
//! single subscription by pulling diffs (or, for list resources, fetching
//! a fresh baseline), and [`SyncReconciler::sync_peer`] walks every
//! subscription to a peer, detecting trust revocation along the way.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::peer_client::PeerClient;
use crate::property::{PropertyChange, PropertyOperation};
use crate::storage::StorageAdapter;
use crate::subscription::callback_processor::ProcessResult;
use crate::subscription::CallbackProcessor;
use crate::types::{buckets, Subscription};
use crate::wire::{
    CallbackEnvelope, CallbackKind, DiffPullResponse, ListBaselineResponse, MetaResponse,
    SubscriptionClearRequest,
};

pub struct SyncReconciler {
    storage: Arc<dyn StorageAdapter>,
    client: PeerClient,
    callback_processor: Arc<CallbackProcessor>,
    config: EngineConfig,
}

/// Outcome of reconciling one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Diffs pulled and applied; carries how many.
    CaughtUp { diffs_applied: usize },
    /// No subscription of that id existed to sync.
    NotFound,
}

impl SyncReconciler {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        client: PeerClient,
        callback_processor: Arc<CallbackProcessor>,
        config: EngineConfig,
    ) -> Self {
        SyncReconciler {
            storage,
            client,
            callback_processor,
            config,
        }
    }

    /// Pull any diffs this actor's outbound (we-subscribed) subscription
    /// has missed, run each through the same sequencing/gap logic inbound
    /// callbacks get, mirror what applies, and — if the peer answered
    /// anything at all — tell it to drop everything up to the sequence we
    /// actually reached (spec §4.5 / original `sync_subscription`).
    pub async fn sync_subscription(&self, actor_id: &str, peer_id: &str, subscription_id: &str) -> Result<SyncOutcome> {
        let sub = match self
            .storage
            .get_subscription(actor_id, peer_id, subscription_id)
            .await?
        {
            Some(sub) => sub,
            None => return Ok(SyncOutcome::NotFound),
        };

        let trust = match self.storage.get_trust(actor_id, peer_id).await? {
            Some(trust) => trust,
            None => return Ok(SyncOutcome::NotFound),
        };

        let diffs_url = format!(
            "{}/subscriptions/{}/{}",
            trust.base_uri.trim_end_matches('/'),
            actor_id,
            subscription_id
        );
        let response = self
            .client
            .get_json::<DiffPullResponse>(&diffs_url, &trust.secret)
            .await?;

        let mut applied = 0usize;
        let mut highest_processed = None;
        for entry in &response.data {
            let envelope = CallbackEnvelope {
                kind: CallbackKind::Diff,
                id: peer_id.to_string(),
                subscription_id: subscription_id.to_string(),
                sequence: Some(entry.sequence),
                target: sub.target.clone(),
                subtarget: sub.subtarget.clone(),
                resource: sub.resource.clone(),
                granularity: match sub.granularity {
                    crate::types::Granularity::High => "high",
                    crate::types::Granularity::Low => "low",
                    crate::types::Granularity::None => "none",
                }
                .to_string(),
                url: None,
                data: Some(entry.data.clone()),
                timestamp: entry.timestamp.clone(),
            };
            match self.callback_processor.process(actor_id, subscription_id, &envelope).await? {
                ProcessResult::Processed { applied: blobs } => {
                    for blob in &blobs {
                        self.mirror_diff_blob(actor_id, peer_id, &sub, blob).await?;
                        applied += 1;
                    }
                    highest_processed = Some(entry.sequence);
                }
                ProcessResult::Duplicate => {}
                ProcessResult::Pending { .. } => {}
                ProcessResult::Rejected | ProcessResult::ResyncTriggered => break,
            }
        }

        if let Some(sequence) = highest_processed {
            self.clear_peer_queue(actor_id, peer_id, subscription_id, &trust, sequence)
                .await;
        }

        if applied > 0 {
            return Ok(SyncOutcome::CaughtUp { diffs_applied: applied });
        }

        // Nothing pending: for list resources, pull a full `?metadata=true`
        // baseline of the actual property resource instead.
        let baseline_url = baseline_resource_url(&trust.base_uri, &sub);
        if let Ok(baseline) = self
            .client
            .get_json::<ListBaselineResponse>(&baseline_url, &trust.secret)
            .await
        {
            for item in &baseline.data {
                self.mirror_baseline_entry(actor_id, peer_id, &sub, item).await?;
            }
            return Ok(SyncOutcome::CaughtUp {
                diffs_applied: baseline.data.len(),
            });
        }

        Ok(SyncOutcome::CaughtUp { diffs_applied: 0 })
    }

    /// Tell the peer it can drop everything up to `sequence` for this
    /// subscription (spec §4.5's queue-clearing PUT). Best-effort: a failed
    /// clear just means the peer re-sends on the next pull, not a sync
    /// failure for us.
    async fn clear_peer_queue(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
        trust: &crate::types::Trust,
        sequence: u64,
    ) {
        let url = format!(
            "{}/subscriptions/{}/{}",
            trust.base_uri.trim_end_matches('/'),
            actor_id,
            subscription_id
        );
        let body = SubscriptionClearRequest { sequence };
        if let Err(err) = self.client.put_json(&url, &trust.secret, &body).await {
            warn!(actor_id, peer_id, subscription_id, ?err, "failed to clear peer's subscription queue");
        }
    }

    async fn mirror_diff_blob(&self, actor_id: &str, peer_id: &str, sub: &Subscription, blob: &Value) -> Result<()> {
        if !self.config.auto_storage {
            return Ok(());
        }
        // `blob` is the wrapper `callback_processor::callback_blob` produces
        // around the envelope; the actual diff shape lives under `data`.
        let Some(diff_blob) = blob.get("data") else {
            return Ok(());
        };
        if let Some(change) = property_change_from_diff(sub, diff_blob) {
            crate::property::mirror_remote_change(self.storage.as_ref(), actor_id, peer_id, &change).await?;
        }
        Ok(())
    }

    async fn mirror_baseline_entry(&self, actor_id: &str, peer_id: &str, sub: &Subscription, item: &Value) -> Result<()> {
        let change = PropertyChange {
            target: sub.target.clone(),
            subtarget: sub.subtarget.clone(),
            resource: sub.resource.clone(),
            operation: PropertyOperation::Put,
            data: Some(item.clone()),
            ..Default::default()
        };
        if self.config.auto_storage {
            crate::property::mirror_remote_change(self.storage.as_ref(), actor_id, peer_id, &change).await?;
        }
        Ok(())
    }

    /// Walk every subscription to `peer_id`, syncing each; detect trust
    /// revocation (spec §4.5, §8 scenario 6): if *every* call to the peer
    /// during this pass returns 404, follow up with a direct trust-verify
    /// GET before concluding the trust was revoked remotely.
    pub async fn sync_peer(&self, actor_id: &str, peer_id: &str) -> Result<()> {
        let trust = match self.storage.get_trust(actor_id, peer_id).await? {
            Some(trust) => trust,
            None => return Ok(()),
        };

        let subs = self
            .storage
            .list_subscriptions_for_peer(actor_id, peer_id)
            .await?;

        let mut saw_success = false;
        let mut saw_not_found = false;
        for sub in &subs {
            match self
                .sync_subscription(actor_id, peer_id, &sub.subscription_id)
                .await
            {
                Ok(_) => saw_success = true,
                Err(err) if err.is_peer_not_found() => saw_not_found = true,
                Err(err) => warn!(actor_id, peer_id, ?err, "sync_subscription failed"),
            }
        }

        if !subs.is_empty() && !saw_success && saw_not_found {
            self.verify_trust_still_alive(actor_id, &trust).await?;
        }

        self.refresh_peer_cache_if_stale(actor_id, &trust).await?;
        Ok(())
    }

    /// Direct confirmation GET before treating an all-404 sync pass as a
    /// revoked trust (spec's stricter, documented two-step detection —
    /// the original implementation skips straight to deletion on an
    /// all-404 pass, but the spec calls for this extra check).
    async fn verify_trust_still_alive(&self, actor_id: &str, trust: &crate::types::Trust) -> Result<()> {
        let url = format!(
            "{}/trust/{}/{}",
            trust.base_uri.trim_end_matches('/'),
            trust.relationship,
            actor_id
        );
        match self
            .client
            .get_json::<serde_json::Value>(&url, &trust.secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_peer_not_found() => {
                warn!(actor_id, peer_id = %trust.peer_id, "trust verification confirms revocation, cleaning up locally");
                self.callback_processor
                    .clear_all_state_for_peer(actor_id, &trust.peer_id)
                    .await?;
                for sub in self
                    .storage
                    .list_subscriptions_for_peer(actor_id, &trust.peer_id)
                    .await?
                {
                    self.storage
                        .delete_subscription(actor_id, &trust.peer_id, &sub.subscription_id)
                        .await?;
                }
                self.storage.delete_trust(actor_id, &trust.peer_id).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Refresh the cached peer profile/capabilities if the TTL has
    /// elapsed, timed to run at the end of `sync_peer` (SPEC_FULL.md §B.5).
    async fn refresh_peer_cache_if_stale(&self, actor_id: &str, trust: &crate::types::Trust) -> Result<()> {
        let fresh = self
            .storage
            .get_attr(actor_id, buckets::PEER_PROFILE, &trust.peer_id)
            .await?
            .map(|attr| is_fresh(&attr.timestamp, self.config.peer_cache_ttl_seconds))
            .unwrap_or(false);
        if fresh {
            return Ok(());
        }

        let url = format!("{}/meta", trust.base_uri.trim_end_matches('/'));
        match self.client.get_json::<MetaResponse>(&url, &trust.secret).await {
            Ok(meta) => {
                self.storage
                    .set_attr(
                        actor_id,
                        buckets::PEER_PROFILE,
                        &trust.peer_id,
                        serde_json::to_value(&meta).unwrap_or(serde_json::Value::Null),
                    )
                    .await?;
                info!(actor_id, peer_id = %trust.peer_id, "refreshed peer profile cache");
            }
            Err(err) => {
                warn!(actor_id, peer_id = %trust.peer_id, ?err, "peer profile refresh failed");
            }
        }
        Ok(())
    }
}

/// `GET <peer>/<target>[/<subtarget>][/<resource>]?metadata=true` (spec
/// §4.5/§B.5): the actual property resource, not the subscription's diff
/// queue, so a list baseline reflects the peer's current state.
fn baseline_resource_url(base_uri: &str, sub: &Subscription) -> String {
    let mut path = format!("{}/{}", base_uri.trim_end_matches('/'), sub.target);
    if let Some(subtarget) = &sub.subtarget {
        path.push('/');
        path.push_str(subtarget);
    }
    if let Some(resource) = &sub.resource {
        path.push('/');
        path.push_str(resource);
    }
    format!("{path}?metadata=true")
}

/// Reconstruct the [`PropertyChange`] a pulled diff blob describes, using
/// the subscription's own addressing (target/subtarget/resource) since a
/// diff blob only carries the operation and its payload (spec §4.3).
fn property_change_from_diff(sub: &Subscription, diff_blob: &Value) -> Option<PropertyChange> {
    let operation: PropertyOperation = serde_json::from_value(diff_blob.get("operation")?.clone()).ok()?;
    let mut change = PropertyChange {
        target: sub.target.clone(),
        subtarget: sub.subtarget.clone(),
        resource: sub.resource.clone(),
        operation,
        ..Default::default()
    };
    if operation.is_list_operation() {
        change.index = diff_blob.get("index").and_then(Value::as_u64).map(|v| v as usize);
        change.length = diff_blob.get("length").and_then(Value::as_u64).map(|v| v as usize);
        change.item = diff_blob.get("item").cloned();
        change.items = diff_blob
            .get("items")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
    } else {
        change.data = diff_blob.get("data").cloned();
    }
    Some(change)
}

fn is_fresh(timestamp: &str, ttl_seconds: u64) -> bool {
    match chrono::DateTime::parse_from_rfc3339(timestamp) {
        Ok(stamped) => {
            let age = Utc::now().signed_duration_since(stamped.with_timezone(&Utc));
            age.num_seconds() < ttl_seconds as i64
        }
        Err(_) => false,
    }
}

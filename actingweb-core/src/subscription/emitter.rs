//! Outbound publisher (spec §4.3, §4.4.1): turns a local property change
//! into sequenced diffs and delivers callbacks to subscribed peers.
//!
//! Grounded on the original `subscription.py`'s `add_diff`: bump the
//! sequence counter first, then persist the diff, rolling the sequence
//! back if the diff write fails so no gap is introduced for a diff that
//! was never actually recorded.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::dispatcher::SharedDispatcher;
use crate::error::Result;
use crate::peer_client::PeerClient;
use crate::permission::{filter_by_permission, PermissionEvaluator};
use crate::property::{build_diff_blob, is_suspended, resume, PropertyChange};
use crate::storage::StorageAdapter;
use crate::types::{Diff, Granularity, Subscription};
use crate::wire::{CallbackEnvelope, CallbackKind};

pub struct SubscriptionEmitter {
    storage: Arc<dyn StorageAdapter>,
    client: PeerClient,
    dispatcher: SharedDispatcher,
    /// This actor's own base URI, used to build the `url` field of
    /// `Granularity::Low` callbacks so the peer knows where to pull the
    /// changed resource from (spec §4.4.1 step 3).
    own_base_uri: String,
}

impl SubscriptionEmitter {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        client: PeerClient,
        dispatcher: SharedDispatcher,
        own_base_uri: impl Into<String>,
    ) -> Self {
        SubscriptionEmitter {
            storage,
            client,
            dispatcher,
            own_base_uri: own_base_uri.into(),
        }
    }

    /// Publish `change` to every inbound subscription (peers who subscribed
    /// to *us*) whose target/subtarget match. `evaluator` is the
    /// permission set scoped to the subscribing peer, if one is cached.
    ///
    /// `Granularity::None` and full permission denial both still record the
    /// diff (retrievable via pull sync, spec §4.3) — only the outbound HTTP
    /// callback is suppressed.
    pub async fn publish(
        &self,
        actor_id: &str,
        change: &PropertyChange,
        permissions_for_peer: impl Fn(&str) -> Option<Arc<PermissionEvaluator>>,
    ) -> Result<()> {
        if is_suspended(self.storage.as_ref(), actor_id, &change.target).await? {
            debug!(actor_id, target = %change.target, "diff emission suspended, dropping change");
            return Ok(());
        }

        for sub in self.storage.list_subscriptions(actor_id).await? {
            if sub.is_callback {
                continue; // this is something *we* subscribed to, not ours to publish
            }
            if !sub.matches_path(&change.target, change.subtarget.as_deref()) {
                continue;
            }

            let sequence = self
                .storage
                .increment_sequence(actor_id, &sub.peer_id, &sub.subscription_id)
                .await?;

            let mut blob = build_diff_blob(change, sub.granularity);
            let mut deliverable = sub.granularity != Granularity::None;

            if deliverable {
                if let Some(obj) = blob.as_object().cloned() {
                    match filter_by_permission(
                        permissions_for_peer(&sub.peer_id).as_deref(),
                        &change.target,
                        &obj,
                        "read",
                    ) {
                        Some(filtered) => blob = serde_json::Value::Object(filtered),
                        None => {
                            debug!(actor_id, peer_id = %sub.peer_id, "diff fully denied by permissions, suppressing callback");
                            deliverable = false;
                        }
                    }
                }
            }

            let diff = Diff {
                actor_id: actor_id.to_string(),
                subscription_id: sub.subscription_id.clone(),
                sequence,
                blob: blob.to_string(),
                timestamp: Utc::now().to_rfc3339(),
            };
            if let Err(err) = self.storage.put_diff(diff.clone()).await {
                warn!(actor_id, peer_id = %sub.peer_id, ?err, "failed to persist diff, rolling back sequence");
                self.storage
                    .decrement_sequence(actor_id, &sub.peer_id, &sub.subscription_id)
                    .await?;
                return Err(err);
            }

            if deliverable {
                self.deliver(actor_id, &sub, sequence, blob).await;
            }
        }
        Ok(())
    }

    /// Resume diff emission for `target` and send exactly one resync
    /// callback to each non-`None`-granularity subscription that was
    /// watching it (spec §4.3, §4.4.1 "Resync callback", §8 boundary).
    pub async fn resume_and_resync(&self, actor_id: &str, target: &str) -> Result<()> {
        resume(self.storage.as_ref(), actor_id, target).await?;

        for sub in self.storage.list_subscriptions(actor_id).await? {
            if sub.is_callback || sub.granularity == Granularity::None {
                continue;
            }
            if sub.target != target {
                continue;
            }
            let envelope = CallbackEnvelope {
                kind: CallbackKind::Resync,
                id: actor_id.to_string(),
                subscription_id: sub.subscription_id.clone(),
                sequence: Some(sub.sequence),
                target: sub.target.clone(),
                subtarget: sub.subtarget.clone(),
                resource: sub.resource.clone(),
                granularity: granularity_wire(sub.granularity).to_string(),
                url: low_granularity_url(&self.own_base_uri, sub.granularity, &sub),
                data: None,
                timestamp: Utc::now().to_rfc3339(),
            };
            self.send_envelope(actor_id, &sub.peer_id, &sub.subscription_id, envelope)
                .await;
        }
        Ok(())
    }

    async fn deliver(&self, actor_id: &str, sub: &Subscription, sequence: u64, blob: serde_json::Value) {
        let envelope = CallbackEnvelope {
            kind: CallbackKind::Diff,
            id: actor_id.to_string(),
            subscription_id: sub.subscription_id.clone(),
            sequence: Some(sequence),
            target: blob
                .get("target")
                .and_then(|v| v.as_str())
                .unwrap_or(&sub.target)
                .to_string(),
            subtarget: blob
                .get("subtarget")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| sub.subtarget.clone()),
            resource: blob
                .get("resource")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| sub.resource.clone()),
            granularity: granularity_wire(sub.granularity).to_string(),
            url: low_granularity_url(&self.own_base_uri, sub.granularity, sub),
            data: blob.get("data").cloned(),
            timestamp: Utc::now().to_rfc3339(),
        };

        self.send_envelope(actor_id, &sub.peer_id, &sub.subscription_id, envelope)
            .await;
    }

    async fn send_envelope(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
        envelope: CallbackEnvelope,
    ) {
        let trust = match self.storage.get_trust(actor_id, peer_id).await {
            Ok(Some(trust)) => trust,
            Ok(None) => {
                warn!(actor_id, peer_id, "no trust for subscribed peer, dropping callback");
                return;
            }
            Err(err) => {
                warn!(actor_id, peer_id, ?err, "storage error looking up trust for callback");
                return;
            }
        };

        let client = self.client.clone();
        let url = format!(
            "{}/subscriptions/{}/{}",
            trust.base_uri.trim_end_matches('/'),
            actor_id,
            subscription_id
        );
        let secret = trust.secret.clone();
        let peer_id = peer_id.to_string();
        let actor_id = actor_id.to_string();

        let work: crate::dispatcher::CallbackFuture = Box::pin(async move {
            let result: Result<serde_json::Value> =
                client.post_json(&url, &secret, &envelope).await;
            if let Err(err) = result {
                warn!(actor_id, peer_id, ?err, "callback delivery failed");
            }
        });

        self.dispatcher.dispatch(work).await;
    }
}

fn granularity_wire(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::High => "high",
        Granularity::Low => "low",
        Granularity::None => "none",
    }
}

fn low_granularity_url(own_base_uri: &str, granularity: Granularity, sub: &Subscription) -> Option<String> {
    if granularity != Granularity::Low {
        return None;
    }
    let mut url = format!("{}/{}", own_base_uri.trim_end_matches('/'), sub.target);
    if let Some(subtarget) = &sub.subtarget {
        url.push('/');
        url.push_str(subtarget);
    }
    if let Some(resource) = &sub.resource {
        url.push('/');
        url.push_str(resource);
    }
    Some(url)
}

//! Inbound callback processor (spec §4.4.2), grounded directly on the
//! original `callback_processor.py`: at-most-once delivery over an
//! unordered transport, with gap detection, duplicate suppression,
//! back-pressure and a timeout-triggered resync escape hatch.
//!
//! State lives in the `_callback_state` attribute bucket, one entry per
//! subscription, and is updated with the storage layer's conditional write
//! so two concurrent deliveries for the same subscription can't race each
//! other into a corrupt sequence.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{ActingWebError, Result};
use crate::peer_client::exponential_backoff;
use crate::storage::{StorageAdapter, WriteOutcome};
use crate::types::buckets;
use crate::wire::{CallbackEnvelope, CallbackKind};

/// Outcome of processing one inbound callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// Applied in order; `applied` may contain more than one diff if this
    /// delivery also drained queued out-of-order callbacks.
    Processed { applied: Vec<Value> },
    /// Already-seen sequence number; discarded, not an error.
    Duplicate,
    /// Sequence is ahead of what's been applied; queued pending the
    /// missing ones arriving (or a resync).
    Pending { queued_sequence: u64 },
    /// The gap has been open longer than `gap_timeout_seconds`, or the
    /// peer itself requested a resync. Caller should run the sync
    /// reconciler for this subscription.
    ResyncTriggered,
    /// The pending queue is full (back-pressure); caller should treat this
    /// delivery as failed so the peer retries later.
    Rejected,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CallbackState {
    last_seq: u64,
    #[serde(default)]
    pending: BTreeMap<u64, Value>,
    #[serde(default)]
    gap_since: Option<DateTime<Utc>>,
}

pub struct CallbackProcessor {
    storage: std::sync::Arc<dyn StorageAdapter>,
    config: EngineConfig,
}

impl CallbackProcessor {
    pub fn new(storage: std::sync::Arc<dyn StorageAdapter>, config: EngineConfig) -> Self {
        CallbackProcessor { storage, config }
    }

    pub async fn process(
        &self,
        actor_id: &str,
        subscription_id: &str,
        envelope: &CallbackEnvelope,
    ) -> Result<ProcessResult> {
        match envelope.kind {
            CallbackKind::Resync => {
                return self.apply_resync(actor_id, subscription_id, envelope).await;
            }
            CallbackKind::Permission => {
                // Not sequenced: permission-change notifications are applied
                // unconditionally and don't participate in gap tracking.
                return Ok(ProcessResult::Processed {
                    applied: vec![envelope.data.clone().unwrap_or(Value::Null)],
                });
            }
            CallbackKind::Diff => {}
        }

        let sequence = envelope.sequence.ok_or_else(|| {
            ActingWebError::SubscriptionSequencing("diff callback missing sequence".into())
        })?;
        let blob = callback_blob(envelope);

        let mut attempt = 0;
        loop {
            let (mut state, version) = self.read_state(actor_id, subscription_id).await?;

            if sequence <= state.last_seq {
                debug!(actor_id, subscription_id, sequence, "duplicate callback, discarding");
                return Ok(ProcessResult::Duplicate);
            }

            if sequence == state.last_seq + 1 {
                let mut applied = vec![blob.clone()];
                let mut cursor = sequence;
                while let Some(next) = state.pending.remove(&(cursor + 1)) {
                    cursor += 1;
                    applied.push(next);
                }
                state.last_seq = cursor;
                if state.pending.is_empty() {
                    state.gap_since = None;
                }

                match self.write_state(actor_id, subscription_id, &state, version).await? {
                    WriteOutcome::Ok => return Ok(ProcessResult::Processed { applied }),
                    WriteOutcome::Conflict => {
                        attempt = self.retry_or_fail(attempt).await?;
                        continue;
                    }
                }
            }

            // Gap: sequence is ahead of what we've applied.
            if state.pending.len() >= self.config.max_pending {
                warn!(actor_id, subscription_id, "pending queue full, rejecting callback");
                return Ok(ProcessResult::Rejected);
            }
            state.pending.insert(sequence, blob.clone());
            let now = Utc::now();
            let gap_since = *state.gap_since.get_or_insert(now);

            let gap_age = (now - gap_since).num_milliseconds().max(0) as f64 / 1000.0;
            if gap_age > self.config.gap_timeout_seconds {
                warn!(actor_id, subscription_id, sequence, "gap timed out, triggering resync");
                self.clear_state(actor_id, subscription_id).await?;
                return Ok(ProcessResult::ResyncTriggered);
            }

            match self.write_state(actor_id, subscription_id, &state, version).await? {
                WriteOutcome::Ok => return Ok(ProcessResult::Pending { queued_sequence: sequence }),
                WriteOutcome::Conflict => {
                    attempt = self.retry_or_fail(attempt).await?;
                    continue;
                }
            }
        }
    }

    /// A peer-initiated resync carries its own caught-up sequence: apply its
    /// payload and jump `last_seq` straight to it, dropping any pending gap
    /// state rather than waiting for the missing entries to arrive.
    async fn apply_resync(
        &self,
        actor_id: &str,
        subscription_id: &str,
        envelope: &CallbackEnvelope,
    ) -> Result<ProcessResult> {
        let sequence = envelope.sequence.ok_or_else(|| {
            ActingWebError::SubscriptionSequencing("resync callback missing sequence".into())
        })?;
        let blob = callback_blob(envelope);

        let mut attempt = 0;
        loop {
            let (_, version) = self.read_state(actor_id, subscription_id).await?;
            let state = CallbackState {
                last_seq: sequence,
                pending: BTreeMap::new(),
                gap_since: None,
            };
            match self.write_state(actor_id, subscription_id, &state, version).await? {
                WriteOutcome::Ok => return Ok(ProcessResult::Processed { applied: vec![blob] }),
                WriteOutcome::Conflict => {
                    attempt = self.retry_or_fail(attempt).await?;
                    continue;
                }
            }
        }
    }

    async fn retry_or_fail(&self, attempt: u32) -> Result<u32> {
        if attempt + 1 >= self.config.max_retries {
            return Err(ActingWebError::SubscriptionSequencing(
                "exhausted retries on callback state conflict".into(),
            ));
        }
        tokio::time::sleep(exponential_backoff(self.config.retry_backoff_base_ms, attempt)).await;
        Ok(attempt + 1)
    }

    async fn read_state(&self, actor_id: &str, subscription_id: &str) -> Result<(CallbackState, u64)> {
        match self
            .storage
            .get_attr(actor_id, buckets::CALLBACK_STATE, subscription_id)
            .await?
        {
            Some(attr) => {
                let state = serde_json::from_value(attr.data).unwrap_or_default();
                Ok((state, attr.version))
            }
            None => Ok((CallbackState::default(), 0)),
        }
    }

    async fn write_state(
        &self,
        actor_id: &str,
        subscription_id: &str,
        state: &CallbackState,
        expected_version: u64,
    ) -> Result<WriteOutcome> {
        let data = serde_json::to_value(state).map_err(|e| {
            ActingWebError::SubscriptionSequencing(format!("failed to serialize callback state: {e}"))
        })?;
        self.storage
            .set_attr_if_version(actor_id, buckets::CALLBACK_STATE, subscription_id, data, expected_version)
            .await
    }

    /// Drop all tracked state for one subscription (used on resync, and on
    /// subscription deletion).
    pub async fn clear_state(&self, actor_id: &str, subscription_id: &str) -> Result<()> {
        self.storage
            .delete_attr(actor_id, buckets::CALLBACK_STATE, subscription_id)
            .await
    }

    /// Drop tracked state for every subscription tied to a peer (spec
    /// §4.5's trust-deletion/revocation cascade).
    pub async fn clear_all_state_for_peer(&self, actor_id: &str, peer_id: &str) -> Result<()> {
        for sub in self
            .storage
            .list_subscriptions_for_peer(actor_id, peer_id)
            .await?
        {
            self.clear_state(actor_id, &sub.subscription_id).await?;
        }
        Ok(())
    }
}

fn callback_blob(envelope: &CallbackEnvelope) -> Value {
    serde_json::json!({
        "target": envelope.target,
        "subtarget": envelope.subtarget,
        "resource": envelope.resource,
        "data": envelope.data,
        "timestamp": envelope.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::sync::Arc;

    fn envelope(sequence: u64) -> CallbackEnvelope {
        CallbackEnvelope {
            kind: CallbackKind::Diff,
            id: "peer1".into(),
            subscription_id: "sub1".into(),
            sequence: Some(sequence),
            target: "properties".into(),
            subtarget: Some("email".into()),
            resource: None,
            granularity: "high".into(),
            url: None,
            data: Some(Value::String("a@b.com".into())),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn processor() -> CallbackProcessor {
        CallbackProcessor::new(Arc::new(MemoryStorage::new()), EngineConfig::default())
    }

    #[tokio::test]
    async fn in_order_delivery_is_processed() {
        let processor = processor();
        let result = processor.process("a1", "sub1", &envelope(1)).await.unwrap();
        assert!(matches!(result, ProcessResult::Processed { .. }));
    }

    #[tokio::test]
    async fn duplicate_sequence_is_discarded() {
        let processor = processor();
        processor.process("a1", "sub1", &envelope(1)).await.unwrap();
        let result = processor.process("a1", "sub1", &envelope(1)).await.unwrap();
        assert_eq!(result, ProcessResult::Duplicate);
    }

    #[tokio::test]
    async fn out_of_order_then_fill_drains_pending() {
        let processor = processor();
        let pending = processor.process("a1", "sub1", &envelope(2)).await.unwrap();
        assert_eq!(pending, ProcessResult::Pending { queued_sequence: 2 });

        let filled = processor.process("a1", "sub1", &envelope(1)).await.unwrap();
        match filled {
            ProcessResult::Processed { applied } => assert_eq!(applied.len(), 2),
            other => panic!("expected drained Processed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_queue_overflow_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let mut config = EngineConfig::default();
        config.max_pending = 1;
        let processor = CallbackProcessor::new(storage, config);

        let first = processor.process("a1", "sub1", &envelope(5)).await.unwrap();
        assert_eq!(first, ProcessResult::Pending { queued_sequence: 5 });
        let second = processor.process("a1", "sub1", &envelope(7)).await.unwrap();
        assert_eq!(second, ProcessResult::Rejected);
    }

    #[tokio::test]
    async fn resync_envelope_advances_last_seq_and_applies() {
        let processor = processor();
        processor.process("a1", "sub1", &envelope(1)).await.unwrap();
        let resync_envelope = CallbackEnvelope {
            kind: CallbackKind::Resync,
            ..envelope(9)
        };
        let result = processor.process("a1", "sub1", &resync_envelope).await.unwrap();
        match result {
            ProcessResult::Processed { applied } => assert_eq!(applied.len(), 1),
            other => panic!("expected the resync payload to apply, got {other:?}"),
        }

        // last_seq jumped to 9: a late arrival for the gap it skipped is
        // now just a duplicate, not a queued pending entry.
        let stale = processor.process("a1", "sub1", &envelope(5)).await.unwrap();
        assert_eq!(stale, ProcessResult::Duplicate);

        let next = processor.process("a1", "sub1", &envelope(10)).await.unwrap();
        assert!(matches!(next, ProcessResult::Processed { .. }));
    }

    #[tokio::test]
    async fn gap_timeout_still_triggers_resync_via_diff_path() {
        let storage = Arc::new(MemoryStorage::new());
        let mut config = EngineConfig::default();
        config.gap_timeout_seconds = 0.0;
        let processor = CallbackProcessor::new(storage, config);

        let result = processor.process("a1", "sub1", &envelope(5)).await.unwrap();
        assert_eq!(result, ProcessResult::ResyncTriggered);
    }
}

//! Trust engine (spec §4.2): establishing, approving, modifying and
//! deleting reciprocal trust relationships.
//!
//! Grounded on the original's `actor.py` `create_reciprocal_trust` /
//! `create_verified_trust` / `delete_reciprocal_trust` family, translated
//! from mutable-actor-state methods into a stateless engine operating over
//! a [`StorageAdapter`] and a [`PeerClient`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ActingWebError, Result};
use crate::peer_client::{exponential_backoff, PeerClient};
use crate::storage::StorageAdapter;
use crate::types::{generate_token, EstablishedVia, Trust};
use crate::wire::{MetaResponse, TrustModifyRequest, TrustRequest, TrustResponse};

/// The trust engine: no actor state of its own, just a storage handle, an
/// HTTP client and config (spec §9's no-back-pointers design).
pub struct TrustEngine {
    storage: Arc<dyn StorageAdapter>,
    client: PeerClient,
    config: EngineConfig,
}

/// Called after a trust transitions from not-mutually-approved to
/// mutually-approved, so the subscription layer can react (spec §4.2,
/// Open Question 1 / SPEC_FULL.md §C.1).
#[async_trait::async_trait]
pub trait TrustActivationListener: Send + Sync {
    async fn on_trust_activated(&self, actor_id: &str, peer_id: &str);
}

impl TrustEngine {
    pub fn new(storage: Arc<dyn StorageAdapter>, client: PeerClient, config: EngineConfig) -> Self {
        TrustEngine {
            storage,
            client,
            config,
        }
    }

    /// Fetch `GET /meta` from a peer with retry/backoff (spec §B.1):
    /// network errors are retried up to `meta_fetch_max_retries` times,
    /// parse errors are not retried.
    async fn fetch_peer_meta(&self, base_uri: &str, bearer: &str) -> Result<MetaResponse> {
        let url = format!("{}/meta", base_uri.trim_end_matches('/'));
        let mut attempt = 0;
        loop {
            match self.client.get_json::<MetaResponse>(&url, bearer).await {
                Ok(meta) => return Ok(meta),
                Err(_) if attempt + 1 < self.config.meta_fetch_max_retries => {
                    attempt += 1;
                    warn!(%url, attempt, "peer meta fetch failed, retrying");
                    tokio::time::sleep(exponential_backoff(
                        self.config.meta_fetch_retry_delay_ms,
                        attempt,
                    ))
                    .await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Establish a reciprocal trust by calling the peer's `POST /trust`
    /// (spec §4.2 "establishment"). Generates a fresh verification token and
    /// sends it along with the request: the initiator is implicitly
    /// verified, since it's the one that generated the token (spec §4.2
    /// step 3). Aborts with `TrustRelationship` if `peer_type_expected` is
    /// given and doesn't match the peer's `/meta` response (step 2).
    pub async fn create_reciprocal_trust(
        &self,
        actor_id: &str,
        peer_base_uri: &str,
        relationship: &str,
        secret: &str,
        our_base_uri: &str,
        our_type: &str,
        peer_type_expected: Option<&str>,
        desc: Option<&str>,
    ) -> Result<Trust> {
        let meta = self.fetch_peer_meta(peer_base_uri, secret).await?;

        if let Some(expected) = peer_type_expected {
            if meta.actor_type != expected {
                return Err(ActingWebError::TrustRelationship(format!(
                    "peer type mismatch: expected {expected}, got {}",
                    meta.actor_type
                )));
            }
        }

        let verification_token = generate_token(32);
        let request = TrustRequest {
            id: actor_id.to_string(),
            baseuri: our_base_uri.to_string(),
            peer_type: our_type.to_string(),
            relationship: relationship.to_string(),
            secret: secret.to_string(),
            verification_token: Some(verification_token.clone()),
            desc: desc.map(|d| d.to_string()),
        };
        let url = format!("{}/trust", peer_base_uri.trim_end_matches('/'));
        let response: TrustResponse = self.client.post_json(&url, secret, &request).await?;

        let trust = Trust {
            actor_id: actor_id.to_string(),
            peer_id: meta.id.clone(),
            base_uri: peer_base_uri.to_string(),
            secret: secret.to_string(),
            peer_type: meta.actor_type,
            relationship: relationship.to_string(),
            approved: true,
            peer_approved: response.approved,
            verified: true,
            verification_token: Some(verification_token),
            established_via: EstablishedVia::Trust,
            client: Default::default(),
            desc: desc.unwrap_or_default().to_string(),
        };
        self.storage.put_trust(trust.clone()).await?;
        info!(actor_id, peer_id = %trust.peer_id, "reciprocal trust created");
        Ok(trust)
    }

    /// Receiver-side verification (spec §4.2 step 4): confirm an inbound
    /// `POST /trust` actually came from the peer it claims to, by calling
    /// back `GET <peer>/trust/<relationship>/<actor_id>` with the peer's
    /// secret and comparing the returned `verification_token` against the
    /// one the inbound request carried. The trust is persisted either way —
    /// a non-matching (or unreachable) verification leaves `verified: false`
    /// rather than aborting the relationship (spec §8).
    pub async fn create_verified_trust(
        &self,
        actor_id: &str,
        peer_id: &str,
        peer_base_uri: &str,
        relationship: &str,
        secret: &str,
        peer_type: &str,
        approved: bool,
        peer_approved: bool,
        expected_verification_token: &str,
        desc: Option<&str>,
    ) -> Result<Trust> {
        let url = format!(
            "{}/trust/{}/{}",
            peer_base_uri.trim_end_matches('/'),
            relationship,
            actor_id
        );
        let verified = match self.client.get_json::<TrustResponse>(&url, secret).await {
            Ok(response) => response.verification_token.as_deref() == Some(expected_verification_token),
            Err(err) => {
                warn!(actor_id, peer_id, ?err, "verification callback failed, leaving trust unverified");
                false
            }
        };

        let trust = Trust {
            actor_id: actor_id.to_string(),
            peer_id: peer_id.to_string(),
            base_uri: peer_base_uri.to_string(),
            secret: secret.to_string(),
            peer_type: peer_type.to_string(),
            relationship: relationship.to_string(),
            approved,
            peer_approved,
            verified,
            verification_token: Some(expected_verification_token.to_string()),
            established_via: EstablishedVia::Trust,
            client: Default::default(),
            desc: desc.unwrap_or_default().to_string(),
        };
        self.storage.put_trust(trust.clone()).await?;
        info!(actor_id, peer_id, verified, "inbound trust verified and persisted");
        Ok(trust)
    }

    /// Approve (or otherwise modify) a trust and, if the modification
    /// observes a `false -> true` transition to mutual approval, notify the
    /// peer and the caller-supplied [`TrustActivationListener`] (Open
    /// Question 1, SPEC_FULL.md §C.1: re-read the persisted row after write,
    /// don't trust the pre-write snapshot).
    pub async fn modify_and_notify(
        &self,
        actor_id: &str,
        peer_id: &str,
        approved: Option<bool>,
        desc: Option<&str>,
        listener: Option<&dyn TrustActivationListener>,
    ) -> Result<Trust> {
        let mut trust = self
            .storage
            .get_trust(actor_id, peer_id)
            .await?
            .ok_or_else(|| ActingWebError::TrustRelationship(format!("no trust with {peer_id}")))?;

        let was_active = trust.is_active();

        if let Some(approved) = approved {
            trust.approved = approved;
        }
        if let Some(desc) = desc {
            trust.desc = desc.to_string();
        }
        self.storage.put_trust(trust.clone()).await?;

        let persisted = self
            .storage
            .get_trust(actor_id, peer_id)
            .await?
            .ok_or_else(|| ActingWebError::TrustRelationship(format!("trust {peer_id} vanished")))?;

        if persisted.has_remote_endpoint() {
            let url = format!(
                "{}/trust/{}/{}",
                persisted.base_uri.trim_end_matches('/'),
                persisted.relationship,
                actor_id
            );
            let body = TrustModifyRequest {
                approved,
                desc: desc.map(|d| d.to_string()),
            };
            if let Err(err) = self.client.put_json(&url, &persisted.secret, &body).await {
                warn!(actor_id, peer_id, ?err, "failed to notify peer of trust modification");
            }
        }

        if !was_active && persisted.is_active() {
            debug!(actor_id, peer_id, "trust became mutually active");
            if let Some(listener) = listener {
                listener.on_trust_activated(actor_id, peer_id).await;
            }
        }

        Ok(persisted)
    }

    /// Delete a reciprocal trust: notify the peer (unless this trust has no
    /// remote endpoint, or the deletion is the peer's own, which the caller
    /// signals via `is_self_deletion`), then remove the local record and
    /// every subscription/diff/attribute bucket tied to the peer.
    ///
    /// `is_self_deletion` mirrors the original's guard against calling back
    /// the peer that is itself the source of this deletion request. Returns
    /// `false` when the peer's `DELETE` failed (spec §4.2 failure
    /// semantics) — the local state is still cleared either way.
    pub async fn delete_reciprocal_trust(
        &self,
        actor_id: &str,
        peer_id: &str,
        is_self_deletion: bool,
    ) -> Result<bool> {
        let trust = self.storage.get_trust(actor_id, peer_id).await?;

        let mut peer_acknowledged = true;
        if let Some(trust) = &trust {
            if !is_self_deletion && trust.has_remote_endpoint() {
                let url = format!(
                    "{}/trust/{}/{}",
                    trust.base_uri.trim_end_matches('/'),
                    trust.relationship,
                    actor_id
                );
                if let Err(err) = self.client.delete(&url, &trust.secret).await {
                    warn!(actor_id, peer_id, ?err, "peer did not acknowledge trust deletion");
                    peer_acknowledged = false;
                }
            }
        }

        self.clear_peer_state(actor_id, peer_id).await?;
        self.storage.delete_trust(actor_id, peer_id).await?;
        info!(actor_id, peer_id, peer_acknowledged, "reciprocal trust deleted");
        Ok(peer_acknowledged)
    }

    /// Remove every subscription (and its diffs) tied to a peer. Used both
    /// by deletion and by revoked-trust detection (spec §4.5).
    pub async fn clear_peer_state(&self, actor_id: &str, peer_id: &str) -> Result<()> {
        for sub in self
            .storage
            .list_subscriptions_for_peer(actor_id, peer_id)
            .await?
        {
            self.storage
                .delete_subscription(actor_id, peer_id, &sub.subscription_id)
                .await?;
        }
        self.storage
            .delete_bucket(actor_id, &crate::types::buckets::remote_mirror(peer_id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine(storage: Arc<dyn StorageAdapter>) -> TrustEngine {
        TrustEngine::new(storage, PeerClient::new(Default::default()), EngineConfig::default())
    }

    #[tokio::test]
    async fn create_reciprocal_trust_persists_locally() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meta"))
            .respond_with(ResponseTemplate::new(200).set_body_json(MetaResponse {
                id: "peer-1".into(),
                actor_type: "urn:actingweb:example:app".into(),
                version: None,
                desc: None,
                capabilities: None,
            }))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/trust"))
            .respond_with(ResponseTemplate::new(201).set_body_json(TrustResponse {
                id: "actor-1".into(),
                baseuri: "https://us.example".into(),
                peer_type: "urn:actingweb:example:app".into(),
                relationship: "friend".into(),
                approved: true,
                verified: false,
                verification_token: None,
            }))
            .mount(&server)
            .await;

        let storage = Arc::new(MemoryStorage::new());
        let trust_engine = engine(storage.clone());
        let trust = trust_engine
            .create_reciprocal_trust(
                "actor-1",
                &server.uri(),
                "friend",
                "shared-secret",
                "https://us.example",
                "urn:actingweb:example:app",
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(trust.peer_id, "peer-1");
        assert!(trust.peer_approved);
        assert!(trust.verified, "initiator is implicitly verified");
        assert!(trust.verification_token.is_some());
        let stored = storage.get_trust("actor-1", "peer-1").await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn create_reciprocal_trust_aborts_on_peer_type_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meta"))
            .respond_with(ResponseTemplate::new(200).set_body_json(MetaResponse {
                id: "peer-1".into(),
                actor_type: "urn:actingweb:example:other".into(),
                version: None,
                desc: None,
                capabilities: None,
            }))
            .mount(&server)
            .await;

        let storage = Arc::new(MemoryStorage::new());
        let trust_engine = engine(storage.clone());
        let result = trust_engine
            .create_reciprocal_trust(
                "actor-1",
                &server.uri(),
                "friend",
                "shared-secret",
                "https://us.example",
                "urn:actingweb:example:app",
                Some("urn:actingweb:example:app"),
                None,
            )
            .await;

        assert!(result.is_err());
        assert!(storage.get_trust("actor-1", "peer-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_verified_trust_matching_token_is_verified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/trust/friend/actor-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(TrustResponse {
                id: "peer-1".into(),
                baseuri: "https://peer.example".into(),
                peer_type: "urn:actingweb:example:app".into(),
                relationship: "friend".into(),
                approved: true,
                verified: false,
                verification_token: Some("tok-123".into()),
            }))
            .mount(&server)
            .await;

        let storage = Arc::new(MemoryStorage::new());
        let trust_engine = engine(storage.clone());
        let trust = trust_engine
            .create_verified_trust(
                "actor-1",
                "peer-1",
                &server.uri(),
                "friend",
                "shared-secret",
                "urn:actingweb:example:app",
                true,
                true,
                "tok-123",
                None,
            )
            .await
            .unwrap();

        assert!(trust.verified);
        assert!(storage.get_trust("actor-1", "peer-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_verified_trust_non_matching_token_is_unverified_but_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/trust/friend/actor-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(TrustResponse {
                id: "peer-1".into(),
                baseuri: "https://peer.example".into(),
                peer_type: "urn:actingweb:example:app".into(),
                relationship: "friend".into(),
                approved: true,
                verified: false,
                verification_token: Some("some-other-token".into()),
            }))
            .mount(&server)
            .await;

        let storage = Arc::new(MemoryStorage::new());
        let trust_engine = engine(storage.clone());
        let trust = trust_engine
            .create_verified_trust(
                "actor-1",
                "peer-1",
                &server.uri(),
                "friend",
                "shared-secret",
                "urn:actingweb:example:app",
                true,
                true,
                "tok-123",
                None,
            )
            .await
            .unwrap();

        assert!(!trust.verified);
        assert!(
            storage.get_trust("actor-1", "peer-1").await.unwrap().is_some(),
            "trust is persisted even when verification fails"
        );
    }

    #[tokio::test]
    async fn delete_reports_false_when_peer_delete_fails() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/trust/friend/a1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let storage = Arc::new(MemoryStorage::new());
        storage
            .put_trust(Trust {
                actor_id: "a1".into(),
                peer_id: "p1".into(),
                base_uri: server.uri(),
                secret: "s".into(),
                peer_type: String::new(),
                relationship: "friend".into(),
                approved: true,
                peer_approved: true,
                verified: false,
                verification_token: None,
                established_via: EstablishedVia::Trust,
                client: Default::default(),
                desc: String::new(),
            })
            .await
            .unwrap();

        let trust_engine = engine(storage.clone());
        let acknowledged = trust_engine
            .delete_reciprocal_trust("a1", "p1", false)
            .await
            .unwrap();

        assert!(!acknowledged);
        assert!(storage.get_trust("a1", "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_clears_subscriptions_and_trust() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put_trust(Trust {
                actor_id: "a1".into(),
                peer_id: "p1".into(),
                base_uri: String::new(),
                secret: "s".into(),
                peer_type: String::new(),
                relationship: "friend".into(),
                approved: true,
                peer_approved: true,
                verified: false,
                verification_token: None,
                established_via: EstablishedVia::Oauth2,
                client: Default::default(),
                desc: String::new(),
            })
            .await
            .unwrap();
        storage
            .put_subscription(crate::types::Subscription {
                actor_id: "a1".into(),
                peer_id: "p1".into(),
                subscription_id: "sub1".into(),
                is_callback: false,
                target: "properties".into(),
                subtarget: None,
                resource: None,
                granularity: crate::types::Granularity::High,
                sequence: 0,
            })
            .await
            .unwrap();

        let trust_engine = engine(storage.clone());
        trust_engine
            .delete_reciprocal_trust("a1", "p1", false)
            .await
            .unwrap();

        assert!(storage.get_trust("a1", "p1").await.unwrap().is_none());
        assert!(storage
            .list_subscriptions_for_peer("a1", "p1")
            .await
            .unwrap()
            .is_empty());
    }
}

//! Core entity types (spec §3).
//!
//! These are plain data — the storage adapter owns persistence, the engine
//! components own behavior. No entity holds a reference back to an actor or
//! to another entity; everything is addressed by id (spec §9's arena
//! design).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ActorId = String;
pub type PeerId = String;
pub type SubscriptionId = String;

/// Generate a fresh subscription id, used when a peer's `POST
/// /subscriptions/<peerid>` request doesn't supply one.
pub fn new_subscription_id() -> SubscriptionId {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a random base62 token, used for trust secrets and out-of-band
/// verification tokens (spec §4.2).
pub fn generate_token(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Provenance of a trust relationship. Determines whether remote deletion is
/// attempted (spec §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstablishedVia {
    Trust,
    Oauth2,
    Oauth2Client,
    Mcp,
}

impl Default for EstablishedVia {
    fn default() -> Self {
        EstablishedVia::Trust
    }
}

/// Optional metadata about the client side of a trust (for oauth2/MCP
/// peers that present a named client rather than another actor).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
}

/// A reciprocal trust relationship, keyed by `(actor_id, peer_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trust {
    pub actor_id: ActorId,
    pub peer_id: PeerId,
    pub base_uri: String,
    pub secret: String,
    pub peer_type: String,
    pub relationship: String,
    pub approved: bool,
    pub peer_approved: bool,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_token: Option<String>,
    pub established_via: EstablishedVia,
    #[serde(default)]
    pub client: ClientMetadata,
    #[serde(default)]
    pub desc: String,
}

impl Trust {
    /// Whether this relationship has an actual remote endpoint to notify on
    /// modification or deletion. OAuth2/OAuth2-client trusts have no peer
    /// actor to call back (spec §3, §4.2).
    pub fn has_remote_endpoint(&self) -> bool {
        !matches!(
            self.established_via,
            EstablishedVia::Oauth2 | EstablishedVia::Oauth2Client
        ) && !self.peer_id.starts_with("oauth2:")
            && !self.peer_id.starts_with("oauth2_client:")
    }

    /// Active once both sides have approved, matching the diagram in spec
    /// §4.2 ("Approved(both) ≡ active").
    pub fn is_active(&self) -> bool {
        self.approved && self.peer_approved
    }
}

/// How much is carried inline in a callback. See GLOSSARY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    High,
    Low,
    None,
}

impl Default for Granularity {
    /// Open Question 2 (spec §9): an explicit `None` passed at subscription
    /// creation is coerced to `High` at persistence time.
    fn default() -> Self {
        Granularity::High
    }
}

/// A subscription, keyed by `(actor_id, peer_id, subscription_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub actor_id: ActorId,
    pub peer_id: PeerId,
    pub subscription_id: SubscriptionId,
    /// `true` — we subscribed to the peer (outbound, we receive).
    /// `false` — the peer subscribed to us (inbound, we publish).
    pub is_callback: bool,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtarget: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub granularity: Granularity,
    pub sequence: u64,
}

impl Subscription {
    pub fn matches_path(&self, target: &str, subtarget: Option<&str>) -> bool {
        if self.target != target {
            return false;
        }
        match (&self.subtarget, subtarget) {
            (None, _) => true,
            (Some(s), Some(t)) => s == t,
            (Some(_), None) => false,
        }
    }
}

/// A single sequenced change record (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub actor_id: ActorId,
    pub subscription_id: SubscriptionId,
    pub sequence: u64,
    pub blob: String,
    pub timestamp: String,
}

/// Optional metadata carried alongside a list-valued property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

/// A property value as stored: either a single scalar, or an ordered list
/// plus its metadata. Enforces the spec §3 invariant that a name is either
/// scalar or list, never both, at the type level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyValue {
    Scalar { value: Value },
    List { items: Vec<Value>, metadata: ListMetadata },
}

/// The reserved prefix for list-valued properties in wire/subtarget form.
pub const LIST_PREFIX: &str = "list:";

/// Strip the `list:` wire prefix from a subtarget/path segment, per spec
/// §4.1 ("the `list:` prefix MUST be stripped before evaluation").
pub fn strip_list_prefix(name: &str) -> &str {
    name.strip_prefix(LIST_PREFIX).unwrap_or(name)
}

/// A generic `(actor_id, bucket, name) -> {data, timestamp}` attribute row
/// (spec §3's Attribute/Bucket entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub data: Value,
    pub timestamp: String,
    /// Optimistic-locking version, bumped on every write. Used by the
    /// callback processor's conflict-retry loop (spec §4.4.2, §5).
    #[serde(default)]
    pub version: u64,
}

/// Well-known attribute buckets (spec §3).
pub mod buckets {
    pub const CALLBACK_STATE: &str = "_callback_state";
    pub const SUSPENSIONS: &str = "_suspensions";
    pub const TRUST_PERMISSIONS: &str = "_trust_permissions";
    pub const PEER_PROFILE: &str = "_peer_profile";
    pub const PEER_CAPABILITIES: &str = "_peer_capabilities";
    pub const PEER_PERMISSIONS: &str = "_peer_permissions";

    /// Bucket name for the mirror of a given peer's published state.
    pub fn remote_mirror(peer_id: &str) -> String {
        format!("remote:{peer_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_list_prefix() {
        assert_eq!(strip_list_prefix("list:todos"), "todos");
        assert_eq!(strip_list_prefix("todos"), "todos");
    }

    #[test]
    fn granularity_defaults_to_high() {
        assert_eq!(Granularity::default(), Granularity::High);
    }

    #[test]
    fn generated_token_has_requested_length() {
        assert_eq!(generate_token(32).len(), 32);
        assert_ne!(generate_token(16), generate_token(16));
    }

    #[test]
    fn trust_oauth2_has_no_remote_endpoint() {
        let t = Trust {
            actor_id: "a".into(),
            peer_id: "p".into(),
            base_uri: "https://peer.example".into(),
            secret: "s".into(),
            peer_type: "urn:actingweb:example:app".into(),
            relationship: "friend".into(),
            approved: true,
            peer_approved: true,
            verified: true,
            verification_token: None,
            established_via: EstablishedVia::Oauth2,
            client: ClientMetadata::default(),
            desc: String::new(),
        };
        assert!(!t.has_remote_endpoint());
    }

    #[test]
    fn trust_oauth2_prefixed_peer_id_has_no_remote_endpoint() {
        let t = Trust {
            actor_id: "a".into(),
            peer_id: "oauth2:client-123".into(),
            base_uri: String::new(),
            secret: "s".into(),
            peer_type: String::new(),
            relationship: "friend".into(),
            approved: true,
            peer_approved: true,
            verified: true,
            verification_token: None,
            established_via: EstablishedVia::Trust,
            client: ClientMetadata::default(),
            desc: String::new(),
        };
        assert!(!t.has_remote_endpoint());
    }
}

//! JSON wire contract (spec §6): the bodies exchanged with peers over HTTP.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `GET /meta` response, fetched during trust establishment and peer
/// profile/capability refresh (spec §4.2, §B.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub actor_type: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
}

/// Body of `POST /trust` sent to a peer to establish a reciprocal trust
/// (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRequest {
    pub id: String,
    pub baseuri: String,
    #[serde(rename = "type")]
    pub peer_type: String,
    pub relationship: String,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
}

/// Response to a `POST /trust` call, or the body of the peer's own
/// `POST /trust` for verified/created-then-verify flows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustResponse {
    pub id: String,
    pub baseuri: String,
    #[serde(rename = "type")]
    pub peer_type: String,
    pub relationship: String,
    pub approved: bool,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_token: Option<String>,
}

/// Body of `PUT /trust/<relationship>/<peerid>` used to propagate an
/// approval transition (spec §4.2's `modify_and_notify`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustModifyRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
}

/// Body of `POST /subscriptions/<peerid>` to create a subscription on a
/// peer (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtarget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub granularity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    pub id: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtarget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub granularity: String,
    #[serde(default)]
    pub sequence: u64,
}

/// Kind of callback payload carried over the wire (spec §4.4.1/4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    Diff,
    Resync,
    Permission,
}

/// The inbound callback envelope posted to
/// `POST /subscriptions/<peerid>/<subid>` (spec §4.4.1/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "type")]
    pub kind: CallbackKind,
    /// The publishing actor's own id.
    pub id: String,
    #[serde(rename = "subscriptionid")]
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtarget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub granularity: String,
    /// Present when `granularity` is `low`: where the peer can pull the
    /// changed resource from instead of receiving it inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: String,
}

/// `?metadata=true` baseline response used by the sync reconciler when
/// catching up a list-valued resource (spec §B.5 / original
/// `sync_subscription`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListBaselineResponse {
    pub data: Vec<Value>,
    #[serde(default)]
    pub metadata: Value,
}

/// One entry in a diff-pull response (spec §4.5/§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffEntry {
    pub sequence: u64,
    pub timestamp: String,
    pub data: Value,
}

/// Body of `GET /subscriptions/<peerid>/<subid>` — the diff-pull response
/// (spec §4.5/§6): `sequence` is the peer's current counter for this
/// subscription, `data` the diffs since our last acknowledged sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffPullResponse {
    pub sequence: u64,
    #[serde(default)]
    pub data: Vec<DiffEntry>,
}

/// Body of `PUT /subscriptions/<myid>/<subid>` sent back to a peer after
/// pulling diffs, to clear its queue up to the sequence we've processed
/// (spec §4.5 step 6).
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionClearRequest {
    pub sequence: u64,
}

//! Error taxonomy for the peer interaction engine.
//!
//! Peer-interaction failures never unwind through the engine's public API —
//! they are caught at the call site and returned as a typed [`ActingWebError`]
//! (see spec §7). Storage errors are the one exception: they propagate, since
//! a storage failure mid-operation leaves no safe fallback.

use std::fmt;

/// What a failed peer HTTP call looked like, for callers that want to inspect
/// why an operation failed without the failure raising.
///
/// Mirrors the original implementation's `last_response_code` /
/// `last_response_message` actor fields, but carried on the error value
/// instead of mutable actor state (no back-pointers — see spec §9).
#[derive(Debug, Clone, Default)]
pub struct PeerCallOutcome {
    pub status: Option<u16>,
    pub message: Option<String>,
}

impl fmt::Display for PeerCallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.message) {
            (Some(s), Some(m)) => write!(f, "status={s} message={m}"),
            (Some(s), None) => write!(f, "status={s}"),
            (None, Some(m)) => write!(f, "{m}"),
            (None, None) => write!(f, "no response"),
        }
    }
}

/// Top-level error type returned by every fallible engine operation.
#[derive(Debug, thiserror::Error)]
pub enum ActingWebError {
    #[error("actor not found: {0}")]
    ActorNotFound(String),

    #[error("invalid actor data: {0}")]
    InvalidActorData(String),

    #[error("peer communication failed: {outcome}")]
    PeerCommunication { outcome: PeerCallOutcome },

    #[error("trust relationship error: {0}")]
    TrustRelationship(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("subscription sequencing error: {0}")]
    SubscriptionSequencing(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ActingWebError {
    pub fn peer_communication(status: Option<u16>, message: impl Into<String>) -> Self {
        ActingWebError::PeerCommunication {
            outcome: PeerCallOutcome {
                status,
                message: Some(message.into()),
            },
        }
    }

    /// `true` when the failure is a 404 from the peer — the idempotent-delete
    /// / revocation-detection signal used throughout §4.2 and §4.5.
    pub fn is_peer_not_found(&self) -> bool {
        matches!(
            self,
            ActingWebError::PeerCommunication {
                outcome: PeerCallOutcome { status: Some(404), .. }
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, ActingWebError>;

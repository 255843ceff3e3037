//! CADP federation domain models.
//!
//! Peers gossip agent-discovery records over a single HTTP endpoint
//! (`POST {peer_url}/cadp`) carrying JSON-encoded CADP messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-peer policy gate.
///
/// `Untrusted` peers can be health-checked but never contribute records;
/// `Partial` and `Full` differ only in policy decisions outside this kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Untrusted,
    Partial,
    Full,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::Partial => "partial",
            Self::Full => "full",
        }
    }

    /// Whether records from a peer at this level may be merged locally.
    pub fn allows_record_merge(&self) -> bool {
        !matches!(self, Self::Untrusted)
    }
}

/// Connection status of a mesh peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connected,
    Disconnected,
    Syncing,
    Error,
}

/// A mesh member, keyed locally by `id` (the local id is authoritative;
/// `source_id` is whatever the peer reported about itself at handshake).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationPeer {
    /// Local identifier, assigned when the peer is added.
    pub id: Uuid,
    /// The peer's self-reported id from the handshake.
    pub source_id: Option<String>,
    /// Human-readable name (self-reported).
    pub name: String,
    /// Base URL of the peer (the CADP endpoint is `{url}/cadp`).
    pub url: String,
    /// Trust policy for this peer.
    pub trust_level: TrustLevel,
    /// Capabilities the peer shares.
    pub capabilities: Vec<String>,
    /// When the last successful sync finished.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Connection status.
    pub status: PeerStatus,
}

impl FederationPeer {
    pub fn new(url: impl Into<String>, trust_level: TrustLevel) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: None,
            name: String::new(),
            url: url.into(),
            trust_level,
            capabilities: Vec::new(),
            last_sync_at: None,
            status: PeerStatus::Disconnected,
        }
    }
}

/// CADP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CadpMessageType {
    HealthCheck,
    HealthResponse,
    SyncRequest,
    SyncResponse,
    Lookup,
    LookupResponse,
    Announce,
    Error,
}

/// A CADP wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadpMessage {
    #[serde(rename = "type")]
    pub message_type: CadpMessageType,
    /// Message id.
    pub id: Uuid,
    /// Sending peer id (self-reported).
    pub source: String,
    /// Destination peer id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Type-dependent payload.
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl CadpMessage {
    pub fn new(message_type: CadpMessageType, source: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type,
            id: Uuid::new_v4(),
            source: source.into(),
            destination: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Build a reply of the given type, addressed back to the sender.
    pub fn reply(&self, message_type: CadpMessageType, source: &str, payload: Value) -> Self {
        Self::new(message_type, source, payload).with_destination(self.source.clone())
    }

    /// Build an `error` reply carrying a reason string.
    pub fn error_reply(&self, source: &str, reason: &str) -> Self {
        self.reply(
            CadpMessageType::Error,
            source,
            serde_json::json!({ "error": reason }),
        )
    }
}

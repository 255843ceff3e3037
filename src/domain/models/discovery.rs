//! Agent discovery records.
//!
//! "DNS" here borrows resolver semantics for agent discovery: records carry
//! a TTL, a priority (lower is preferred), and a weight, and expire rather
//! than being deleted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Metadata key marking the peer a federated record came from.
pub const META_FEDERATED_FROM: &str = "_federatedFrom";
/// Metadata key stamping when a federated record was merged.
pub const META_FEDERATED_AT: &str = "_federatedAt";
/// Metadata key marking a record cached by a federated lookup.
pub const META_FEDERATED_LOOKUP: &str = "_federatedLookup";

/// An agent discovery record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDnsRecord {
    /// Globally unique agent id.
    pub agent_id: String,
    /// Domain the agent serves.
    pub domain: String,
    /// Endpoint URLs, most-preferred first.
    pub endpoints: Vec<String>,
    /// Capabilities the agent advertises.
    pub capabilities: Vec<String>,
    /// Time to live in seconds.
    pub ttl_seconds: u64,
    /// Priority; lower is more preferred.
    pub priority: i32,
    /// Weight among records of equal priority.
    pub weight: i32,
    /// When the record was registered.
    pub created_at: DateTime<Utc>,
    /// `created_at + ttl`; expired records are never returned.
    pub expires_at: DateTime<Utc>,
    /// Open-schema metadata (federation provenance lives here).
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AgentDnsRecord {
    /// Create a record with the TTL-derived expiry.
    pub fn new(agent_id: impl Into<String>, domain: impl Into<String>, ttl_seconds: u64) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            domain: domain.into(),
            endpoints: Vec::new(),
            capabilities: Vec::new(),
            ttl_seconds,
            priority: 10,
            weight: 1,
            created_at: now,
            expires_at: now + Duration::milliseconds(ttl_seconds as i64 * 1000),
            metadata: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    /// Re-derive `expires_at` from a new TTL, anchored at `created_at`.
    pub fn with_ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self.expires_at = self.created_at + Duration::milliseconds(ttl_seconds as i64 * 1000);
        self
    }

    /// Whether the record has expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether the record has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the agent advertises `capability` (case-insensitive).
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }

    /// The peer id this record was federated from, if any.
    pub fn federated_from(&self) -> Option<&str> {
        self.metadata.get(META_FEDERATED_FROM).and_then(Value::as_str)
    }

    /// Whether the record was merged from a peer (as opposed to registered
    /// locally by a collaborator).
    pub fn is_federated(&self) -> bool {
        self.metadata.contains_key(META_FEDERATED_FROM)
    }

    /// Stamp federation provenance onto the record.
    pub fn mark_federated_from(&mut self, peer_id: &str) {
        self.metadata.insert(
            META_FEDERATED_FROM.to_string(),
            Value::String(peer_id.to_string()),
        );
        self.metadata.insert(
            META_FEDERATED_AT.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }
}

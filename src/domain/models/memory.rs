//! Context memory domain model.
//!
//! Two-tier memory system:
//! - STM: small, hot store of recent facts
//! - LTM: larger store of reinforced knowledge
//!
//! Entries carry a Q-value in `[0, 1]` updated by a Bellman-style rule; the
//! Q-value drives eviction, promotion, and compression.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Memory scope (tier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    /// Short-term memory.
    Stm,
    /// Long-term memory.
    Ltm,
}

impl MemoryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stm => "stm",
            Self::Ltm => "ltm",
        }
    }
}

impl std::fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single memory entry, owned by exactly one store at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique identifier.
    pub id: Uuid,
    /// Lookup key, unique within its scope.
    pub key: String,
    /// Opaque value text.
    pub value: String,
    /// Current scope; changed only by promotion/demotion.
    pub scope: MemoryScope,
    /// Expected usefulness of retaining the entry, clamped to `[0, 1]`.
    pub q_value: f64,
    /// Number of times the entry has been returned by retrieval.
    pub access_count: u64,
    /// Tags for filtered retrieval.
    pub tags: Vec<String>,
    /// Importance assigned at store time (seeds the Q-value).
    pub importance: f64,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry was last returned by retrieval.
    pub last_accessed_at: DateTime<Utc>,
}

impl MemoryEntry {
    /// Create a new entry in the given scope.
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        scope: MemoryScope,
        importance: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            value: value.into(),
            scope,
            q_value: importance.clamp(0.0, 1.0),
            access_count: 0,
            tags: Vec::new(),
            importance: importance.clamp(0.0, 1.0),
            created_at: now,
            last_accessed_at: now,
        }
    }

    /// Set tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Record a retrieval hit: bump the access count and the access stamp.
    pub fn record_access(&mut self) {
        self.access_count += 1;
        self.last_accessed_at = Utc::now();
    }

    /// Set the Q-value, clamped to `[0, 1]`.
    pub fn set_q(&mut self, q: f64) {
        self.q_value = q.clamp(0.0, 1.0);
    }

    /// Summary line used by compression: `[key]: first 100 chars of value`.
    pub fn summary_line(&self) -> String {
        let head: String = self.value.chars().take(100).collect();
        format!("[{}]: {}", self.key, head)
    }
}

/// Immutable artifact produced by compressing low-value STM entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBlock {
    /// Unique identifier.
    pub id: Uuid,
    /// Concatenated summaries of the source entries.
    pub summary: String,
    /// Ids of the entries that were folded into this block.
    pub source_ids: Vec<Uuid>,
    /// When the block was created.
    pub created_at: DateTime<Utc>,
    /// Characters in the summary over characters in the sources.
    pub compression_ratio: f64,
}

impl KnowledgeBlock {
    /// Build a block from source entries, joining summaries with ` | `.
    pub fn from_entries(entries: &[MemoryEntry]) -> Self {
        let summary = entries
            .iter()
            .map(MemoryEntry::summary_line)
            .collect::<Vec<_>>()
            .join(" | ");
        let source_chars: usize = entries.iter().map(|e| e.value.chars().count()).sum();
        let ratio = if source_chars == 0 {
            1.0
        } else {
            summary.chars().count() as f64 / source_chars as f64
        };
        Self {
            id: Uuid::new_v4(),
            summary,
            source_ids: entries.iter().map(|e| e.id).collect(),
            created_at: Utc::now(),
            compression_ratio: ratio,
        }
    }
}

//! Consumption ledger domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// An append-only ledger entry recording one model call.
///
/// Never mutated after insertion; `cost` is non-negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    /// Unique identifier, assigned at ingest.
    pub id: Uuid,
    /// Ingest timestamp, assigned at ingest.
    pub timestamp: DateTime<Utc>,
    /// Agent that made the call.
    pub agent_id: String,
    /// Task the call belonged to, if any.
    pub task_id: Option<Uuid>,
    /// Model name as billed.
    pub model: String,
    /// Input token count.
    pub input_tokens: u64,
    /// Output token count.
    pub output_tokens: u64,
    /// Monetary cost in USD.
    pub cost: f64,
    /// Open-schema tags (`team`, `project`, ...).
    pub tags: HashMap<String, String>,
}

/// Draft of a consumption record before the engine assigns id + timestamp.
#[derive(Debug, Clone, Default)]
pub struct ConsumptionDraft {
    pub agent_id: String,
    pub task_id: Option<Uuid>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub tags: HashMap<String, String>,
}

impl ConsumptionDraft {
    pub fn new(agent_id: impl Into<String>, model: impl Into<String>, cost: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            model: model.into(),
            cost,
            ..Default::default()
        }
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Filter for ledger queries; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ConsumptionFilter {
    pub agent_id: Option<String>,
    pub task_id: Option<Uuid>,
    pub model: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ConsumptionFilter {
    pub fn matches(&self, record: &ConsumptionRecord) -> bool {
        if let Some(agent) = &self.agent_id {
            if &record.agent_id != agent {
                return false;
            }
        }
        if let Some(task) = self.task_id {
            if record.task_id != Some(task) {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if &record.model != model {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Canonical rendering of a tag map: sorted by key, `k=v` joined with `,`.
///
/// Used wherever tags act as a composite aggregation key so that iteration
/// order never leaks into report groupings.
pub fn canonical_tag_key(tags: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = tags.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

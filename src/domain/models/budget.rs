//! Budget envelope domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Level at which a budget applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    Organization,
    Team,
    Agent,
    Task,
}

impl BudgetLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Team => "team",
            Self::Agent => "agent",
            Self::Task => "task",
        }
    }
}

impl std::fmt::Display for BudgetLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A monetary envelope matched against consumption records.
///
/// `spent` is non-decreasing; budgets never block spending — enforcement is
/// the caller's job (the router consults remaining budget before spending).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Level at which the budget matches records.
    pub level: BudgetLevel,
    /// Entity the budget is scoped to: a team tag value, an agent id, or a
    /// task id, depending on `level`. `None` for organization budgets.
    pub entity_id: Option<String>,
    /// Monetary limit in USD, strictly positive.
    pub limit: f64,
    /// Monetary spend accumulated so far, non-negative.
    pub spent: f64,
    /// Alert threshold as a fraction of `limit`, in `(0, 1]`.
    pub alert_threshold: f64,
    /// When the budget was created.
    pub created_at: DateTime<Utc>,
}

impl Budget {
    pub fn new(name: impl Into<String>, level: BudgetLevel, limit: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            level,
            entity_id: None,
            limit,
            spent: 0.0,
            alert_threshold: 0.8,
            created_at: Utc::now(),
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_alert_threshold(mut self, threshold: f64) -> Self {
        self.alert_threshold = threshold;
        self
    }

    /// Fraction of the limit consumed.
    pub fn percent_used(&self) -> f64 {
        if self.limit <= 0.0 {
            return 0.0;
        }
        self.spent / self.limit
    }

    /// Remaining headroom in USD (never negative).
    pub fn remaining(&self) -> f64 {
        (self.limit - self.spent).max(0.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.limit <= 0.0 {
            return Err("budget limit must be positive".to_string());
        }
        if self.spent < 0.0 {
            return Err("budget spend cannot be negative".to_string());
        }
        if self.alert_threshold <= 0.0 || self.alert_threshold > 1.0 {
            return Err("alert threshold must be in (0, 1]".to_string());
        }
        Ok(())
    }
}

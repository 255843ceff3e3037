//! FinOps engine: consumption ledger, budget matching, threshold alerting,
//! forecasting, and rightsizing.
//!
//! Budgets alert but never block; blocking enforcement lives in the router's
//! [`BudgetGate`](super::router::BudgetGate). Ledger append, budget
//! matching, and alert evaluation form a single critical section.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::forecaster::{self, Forecast, ForecastPeriod};
use super::rightsizing::{self, Recommendation};
use crate::domain::models::{
    canonical_tag_key, Budget, BudgetLevel, ConsumptionDraft, ConsumptionFilter,
    ConsumptionRecord,
};
use crate::domain::{KernelError, KernelResult};

/// Runtime configuration for the FinOps engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinOpsConfig {
    pub enabled: bool,
    /// Ledger bound; the oldest record is dropped (FIFO) past this.
    pub max_records: usize,
    pub forecast_enabled: bool,
    pub rightsizing_enabled: bool,
    /// Cadence hint for report generation by the host process.
    pub report_interval_ms: u64,
    /// Alert threshold applied when a budget does not set its own.
    pub default_budget_alert_threshold: f64,
}

impl Default for FinOpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_records: 100_000,
            forecast_enabled: true,
            rightsizing_enabled: true,
            report_interval_ms: 3_600_000,
            default_budget_alert_threshold: 0.8,
        }
    }
}

/// Typed events emitted by the engine.
#[derive(Debug, Clone)]
pub enum FinOpsEvent {
    /// A budget crossed its alert threshold (at most once per crossing).
    BudgetAlert {
        budget_id: Uuid,
        name: String,
        percent_used: f64,
    },
    /// A budget crossed 100% of its limit.
    BudgetExceeded {
        budget_id: Uuid,
        name: String,
        percent_used: f64,
    },
    /// The FIFO trim dropped the oldest ledger record.
    RecordDropped { record_id: Uuid },
}

/// Aggregate slice of a report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostAggregate {
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub record_count: usize,
}

/// A cost report over a time window.
#[derive(Debug, Clone)]
pub struct FinOpsReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total: CostAggregate,
    pub by_agent: BTreeMap<String, CostAggregate>,
    pub by_model: BTreeMap<String, CostAggregate>,
    /// Keyed by the canonical sorted tag tuple.
    pub by_tags: BTreeMap<String, CostAggregate>,
    pub budgets: Vec<Budget>,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Default, Clone, Copy)]
struct AlertState {
    alert_fired: bool,
    exceeded_fired: bool,
}

struct Inner {
    records: VecDeque<ConsumptionRecord>,
    budgets: HashMap<Uuid, Budget>,
    alerts: HashMap<Uuid, AlertState>,
    dropped: u64,
}

/// Consumption ledger with budget enforcement signals.
#[derive(Clone)]
pub struct FinOpsEngine {
    config: FinOpsConfig,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<FinOpsEvent>,
}

impl FinOpsEngine {
    pub fn new(config: FinOpsConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                records: VecDeque::new(),
                budgets: HashMap::new(),
                alerts: HashMap::new(),
                dropped: 0,
            })),
            events,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FinOpsConfig::default())
    }

    /// Subscribe to budget and ledger events.
    pub fn subscribe(&self) -> broadcast::Receiver<FinOpsEvent> {
        self.events.subscribe()
    }

    /// Ingest one consumption record: assign id and timestamp, append to the
    /// ledger, trim FIFO, and update every matching budget.
    pub async fn record_consumption(
        &self,
        draft: ConsumptionDraft,
    ) -> KernelResult<ConsumptionRecord> {
        if draft.cost < 0.0 {
            return Err(KernelError::ValidationFailed(
                "consumption cost cannot be negative".to_string(),
            ));
        }
        let record = ConsumptionRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            agent_id: draft.agent_id,
            task_id: draft.task_id,
            model: draft.model,
            input_tokens: draft.input_tokens,
            output_tokens: draft.output_tokens,
            cost: draft.cost,
            tags: draft.tags,
        };
        if !self.config.enabled {
            return Ok(record);
        }

        let mut inner = self.inner.lock().await;
        inner.records.push_back(record.clone());
        if inner.records.len() > self.config.max_records {
            if let Some(dropped) = inner.records.pop_front() {
                inner.dropped += 1;
                let _ = self
                    .events
                    .send(FinOpsEvent::RecordDropped { record_id: dropped.id });
            }
        }

        let matching: Vec<Uuid> = inner
            .budgets
            .values()
            .filter(|b| Self::budget_matches(b, &record))
            .map(|b| b.id)
            .collect();
        for budget_id in matching {
            self.update_budget_spend(&mut inner, budget_id, record.cost);
        }

        debug!(agent = %record.agent_id, model = %record.model, cost = record.cost, "consumption recorded");
        Ok(record)
    }

    /// Create a budget. The default alert threshold applies when none is set.
    pub async fn create_budget(&self, mut budget: Budget) -> KernelResult<Budget> {
        if budget.alert_threshold <= 0.0 {
            budget.alert_threshold = self.config.default_budget_alert_threshold;
        }
        budget
            .validate()
            .map_err(KernelError::ValidationFailed)?;
        let mut inner = self.inner.lock().await;
        inner.alerts.insert(budget.id, AlertState::default());
        inner.budgets.insert(budget.id, budget.clone());
        info!(budget = %budget.name, limit = budget.limit, "budget created");
        Ok(budget)
    }

    pub async fn get_budget(&self, id: Uuid) -> Option<Budget> {
        self.inner.lock().await.budgets.get(&id).cloned()
    }

    pub async fn get_budgets(&self) -> Vec<Budget> {
        let inner = self.inner.lock().await;
        let mut budgets: Vec<Budget> = inner.budgets.values().cloned().collect();
        budgets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        budgets
    }

    /// Ledger records matching `filter`, in insertion order.
    pub async fn get_consumption(&self, filter: &ConsumptionFilter) -> Vec<ConsumptionRecord> {
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Number of records dropped by the FIFO trim.
    pub async fn dropped_records(&self) -> u64 {
        self.inner.lock().await.dropped
    }

    /// Forecast an agent's spend one period ahead.
    pub async fn forecast(&self, agent_id: &str, period: ForecastPeriod) -> Forecast {
        let inner = self.inner.lock().await;
        if !self.config.forecast_enabled {
            return forecaster::forecast(&[], agent_id, period);
        }
        let records: Vec<ConsumptionRecord> = inner.records.iter().cloned().collect();
        forecaster::forecast(&records, agent_id, period)
    }

    /// Generate rightsizing recommendations, optionally for one agent.
    pub async fn generate_recommendations(&self, agent_id: Option<&str>) -> Vec<Recommendation> {
        if !self.config.rightsizing_enabled {
            return Vec::new();
        }
        let inner = self.inner.lock().await;
        let records: Vec<ConsumptionRecord> = inner.records.iter().cloned().collect();
        rightsizing::generate_recommendations(&records, agent_id)
    }

    /// Aggregate the window `[start, end]` by agent, model, and tag tuple.
    pub async fn generate_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> FinOpsReport {
        let (window, budgets) = {
            let inner = self.inner.lock().await;
            let window: Vec<ConsumptionRecord> = inner
                .records
                .iter()
                .filter(|r| r.timestamp >= start && r.timestamp <= end)
                .cloned()
                .collect();
            let mut budgets: Vec<Budget> = inner.budgets.values().cloned().collect();
            budgets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            (window, budgets)
        };

        let mut total = CostAggregate::default();
        let mut by_agent: BTreeMap<String, CostAggregate> = BTreeMap::new();
        let mut by_model: BTreeMap<String, CostAggregate> = BTreeMap::new();
        let mut by_tags: BTreeMap<String, CostAggregate> = BTreeMap::new();
        for record in &window {
            Self::accumulate(&mut total, record);
            Self::accumulate(by_agent.entry(record.agent_id.clone()).or_default(), record);
            Self::accumulate(by_model.entry(record.model.clone()).or_default(), record);
            Self::accumulate(
                by_tags.entry(canonical_tag_key(&record.tags)).or_default(),
                record,
            );
        }

        let recommendations = if self.config.rightsizing_enabled {
            rightsizing::generate_recommendations(&window, None)
        } else {
            Vec::new()
        };

        FinOpsReport {
            start,
            end,
            total,
            by_agent,
            by_model,
            by_tags,
            budgets,
            recommendations,
        }
    }

    /// Matching rules per budget level.
    fn budget_matches(budget: &Budget, record: &ConsumptionRecord) -> bool {
        match budget.level {
            BudgetLevel::Organization => true,
            BudgetLevel::Team => match (&budget.entity_id, record.tags.get("team")) {
                (Some(entity), Some(team)) => entity == team,
                _ => false,
            },
            BudgetLevel::Agent => budget.entity_id.as_deref() == Some(record.agent_id.as_str()),
            BudgetLevel::Task => match (&budget.entity_id, record.task_id) {
                (Some(entity), Some(task_id)) => *entity == task_id.to_string(),
                _ => false,
            },
        }
    }

    /// Increment a budget's spend and fire threshold events once per
    /// crossing. `spent` is monotonic, so each signal fires at most once in
    /// a budget's lifetime.
    fn update_budget_spend(&self, inner: &mut Inner, budget_id: Uuid, amount: f64) {
        let Some(budget) = inner.budgets.get_mut(&budget_id) else {
            return;
        };
        budget.spent += amount;
        let percent_used = budget.percent_used();
        let name = budget.name.clone();
        let threshold = budget.alert_threshold;

        let state = inner.alerts.entry(budget_id).or_default();
        if !state.alert_fired && percent_used >= threshold {
            state.alert_fired = true;
            info!(budget = %name, percent = percent_used, "budget alert threshold crossed");
            let _ = self.events.send(FinOpsEvent::BudgetAlert {
                budget_id,
                name: name.clone(),
                percent_used,
            });
        }
        if !state.exceeded_fired && percent_used >= 1.0 {
            state.exceeded_fired = true;
            info!(budget = %name, percent = percent_used, "budget exceeded");
            let _ = self.events.send(FinOpsEvent::BudgetExceeded {
                budget_id,
                name,
                percent_used,
            });
        }
    }

    fn accumulate(aggregate: &mut CostAggregate, record: &ConsumptionRecord) {
        aggregate.cost += record.cost;
        aggregate.input_tokens += record.input_tokens;
        aggregate.output_tokens += record.output_tokens;
        aggregate.record_count += 1;
    }
}

//! Rightsizing recommender.
//!
//! Inspects the consumption ledger per `(agent, model)` and recommends
//! cheaper models where the observed workload does not justify the model's
//! capability class. Only catalog models of capability 3+ with a defined
//! downgrade path are candidates.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use super::pricing;
use crate::domain::models::ConsumptionRecord;

/// Which rule produced a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationRule {
    /// Mean output below 100 tokens: the first downgrade suffices.
    SimpleTask,
    /// Stable cost profile with modest output: skip two capability steps.
    LowVariance,
}

impl RecommendationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimpleTask => "simple-task",
            Self::LowVariance => "low-variance",
        }
    }
}

/// A model downgrade recommendation.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub id: Uuid,
    pub agent_id: String,
    pub current_model: String,
    pub recommended_model: String,
    pub rule: RecommendationRule,
    /// Projected saving over the observed spend, USD.
    pub estimated_savings: f64,
    /// Expected quality degradation, `[0, 1]`.
    pub quality_impact: f64,
    /// Records behind the recommendation.
    pub record_count: usize,
    pub created_at: DateTime<Utc>,
}

struct ModelUsage {
    count: usize,
    total_cost: f64,
    costs: Vec<f64>,
    total_input: u64,
    total_output: u64,
}

/// Generate recommendations for every agent (or just `agent_id`).
pub fn generate_recommendations(
    records: &[ConsumptionRecord],
    agent_id: Option<&str>,
) -> Vec<Recommendation> {
    let mut usage: HashMap<(String, String), ModelUsage> = HashMap::new();
    for record in records {
        if let Some(agent) = agent_id {
            if record.agent_id != agent {
                continue;
            }
        }
        let entry = usage
            .entry((record.agent_id.clone(), record.model.clone()))
            .or_insert_with(|| ModelUsage {
                count: 0,
                total_cost: 0.0,
                costs: Vec::new(),
                total_input: 0,
                total_output: 0,
            });
        entry.count += 1;
        entry.total_cost += record.cost;
        entry.costs.push(record.cost);
        entry.total_input += record.input_tokens;
        entry.total_output += record.output_tokens;
    }

    let mut groups: Vec<((String, String), ModelUsage)> = usage.into_iter().collect();
    groups.sort_by(|a, b| a.0.cmp(&b.0));

    let mut recommendations = Vec::new();
    for ((agent, model), stats) in groups {
        let Some(current) = pricing::find_model(&model) else {
            continue;
        };
        if current.capability < 3 || current.downgrades.is_empty() {
            continue;
        }

        let mean_input = stats.total_input as f64 / stats.count as f64;
        let mean_output = stats.total_output as f64 / stats.count as f64;

        let pick = |target: &str, rule: RecommendationRule, impact: f64| {
            let cheaper = pricing::find_model(target)?;
            let current_per_1k = current.cost_per_1k(mean_input, mean_output);
            let cheaper_per_1k = cheaper.cost_per_1k(mean_input, mean_output);
            let savings = stats.total_cost * (1.0 - cheaper_per_1k / current_per_1k);
            if savings <= 0.0 {
                return None;
            }
            Some(Recommendation {
                id: Uuid::new_v4(),
                agent_id: agent.clone(),
                current_model: current.name.to_string(),
                recommended_model: cheaper.name.to_string(),
                rule,
                estimated_savings: savings,
                quality_impact: impact,
                record_count: stats.count,
                created_at: Utc::now(),
            })
        };

        if mean_output < 100.0 {
            if let Some(rec) = pick(current.downgrades[0], RecommendationRule::SimpleTask, 0.05) {
                recommendations.push(rec);
                continue;
            }
        }

        if stats.count >= 10 && mean_output < 500.0 {
            let cv = coefficient_of_variation(&stats.costs);
            if cv < 0.3 {
                let target = current.downgrades.get(1).unwrap_or(&current.downgrades[0]);
                if let Some(rec) = pick(target, RecommendationRule::LowVariance, 0.10) {
                    recommendations.push(rec);
                }
            }
        }
    }
    recommendations
}

/// Population standard deviation over mean; 0 for degenerate inputs.
fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

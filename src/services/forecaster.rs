//! Linear-regression cost forecasting.
//!
//! Fits ordinary least squares over the cumulative cost and token series of
//! an agent's ledger records and extrapolates one period ahead. Forecasts
//! are deterministic in the records: calling twice without intervening
//! ingest returns identical results.

use chrono::{DateTime, Utc};

use crate::domain::models::ConsumptionRecord;

/// Forecast horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForecastPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl ForecastPeriod {
    /// Fixed period length in milliseconds.
    pub fn period_ms(&self) -> f64 {
        match self {
            Self::Hourly => 3.6e6,
            Self::Daily => 8.64e7,
            Self::Weekly => 6.048e8,
            Self::Monthly => 2.592e9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

/// A cost/token forecast for one agent and period.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub agent_id: String,
    pub period: ForecastPeriod,
    /// Projected spend over the period, USD, never negative.
    pub estimated_cost: f64,
    /// Projected token volume over the period, never negative.
    pub estimated_tokens: f64,
    /// `min(1, r² · min(1, n/10))`.
    pub confidence: f64,
    /// Number of records the fit used.
    pub sample_count: usize,
    pub generated_from: Option<DateTime<Utc>>,
}

/// Slope and coefficient of determination of an OLS fit.
///
/// Fewer than two points or zero x-variance yields `(0, 0)`.
fn linear_regression(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len();
    if n < 2 {
        return (0.0, 0.0);
    }
    let n_f = n as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n_f;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n_f;

    let ss_xx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    if ss_xx == 0.0 {
        return (0.0, 0.0);
    }
    let ss_xy: f64 = points
        .iter()
        .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
        .sum();
    let slope = ss_xy / ss_xx;
    let intercept = mean_y - slope * mean_x;

    let ss_tot: f64 = points.iter().map(|p| (p.1 - mean_y).powi(2)).sum();
    if ss_tot == 0.0 {
        return (slope, 0.0);
    }
    let ss_res: f64 = points
        .iter()
        .map(|p| (p.1 - (slope * p.0 + intercept)).powi(2))
        .sum();
    let r2 = (1.0 - ss_res / ss_tot).clamp(0.0, 1.0);
    (slope, r2)
}

/// Forecast an agent's spend and token volume one period ahead.
pub fn forecast(
    records: &[ConsumptionRecord],
    agent_id: &str,
    period: ForecastPeriod,
) -> Forecast {
    let mut own: Vec<&ConsumptionRecord> =
        records.iter().filter(|r| r.agent_id == agent_id).collect();
    own.sort_by_key(|r| r.timestamp);

    // Anchor timestamps at the first sample to keep the fit numerically
    // well-conditioned.
    let x0 = own
        .first()
        .map(|r| r.timestamp.timestamp_millis() as f64)
        .unwrap_or(0.0);

    let mut cost_points = Vec::with_capacity(own.len());
    let mut token_points = Vec::with_capacity(own.len());
    let mut cumulative_cost = 0.0;
    let mut cumulative_tokens = 0.0;
    for record in &own {
        let x = record.timestamp.timestamp_millis() as f64 - x0;
        cumulative_cost += record.cost;
        cumulative_tokens += (record.input_tokens + record.output_tokens) as f64;
        cost_points.push((x, cumulative_cost));
        token_points.push((x, cumulative_tokens));
    }

    let (cost_slope, cost_r2) = linear_regression(&cost_points);
    let (token_slope, _) = linear_regression(&token_points);

    let n = own.len();
    let confidence = (cost_r2 * (n as f64 / 10.0).min(1.0)).min(1.0);

    Forecast {
        agent_id: agent_id.to_string(),
        period,
        estimated_cost: (cost_slope * period.period_ms()).max(0.0),
        estimated_tokens: (token_slope * period.period_ms()).max(0.0),
        confidence,
        sample_count: n,
        generated_from: own.last().map(|r| r.timestamp),
    }
}

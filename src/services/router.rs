//! Role/complexity/cost model routing and the run budget gate.
//!
//! The router picks an abstract tier from the agent's role and task
//! complexity, resolves it to a concrete model in the pricing catalog, and
//! downgrades to the provider's fast model when the estimated cost would eat
//! too much of the remaining run budget.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::pricing::{self, ModelTier};
use crate::domain::{KernelError, KernelResult};

/// Agent roles known to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Researcher,
    Validator,
    Developer,
    Architect,
    Tester,
    Orchestrator,
    UxAgent,
    Generalist,
}

impl AgentRole {
    /// Parse a role name; unknown names fall back to `Generalist`.
    pub fn parse(role: &str) -> Self {
        match role.to_lowercase().as_str() {
            "researcher" => Self::Researcher,
            "validator" => Self::Validator,
            "developer" => Self::Developer,
            "architect" => Self::Architect,
            "tester" => Self::Tester,
            "orchestrator" => Self::Orchestrator,
            "ux-agent" | "ux_agent" | "ux" => Self::UxAgent,
            _ => Self::Generalist,
        }
    }
}

/// Runtime configuration for the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Provider whose models are preferred.
    pub provider: String,
    /// Force the fast tier regardless of role and complexity.
    pub prefer_cheap: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            prefer_cheap: false,
        }
    }
}

/// A routing request.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub role: AgentRole,
    /// Task complexity in `[0, 1]`.
    pub complexity: f64,
    /// Expected token volume of the call.
    pub estimated_tokens: u64,
    /// Remaining run budget in USD.
    pub remaining_budget: f64,
}

/// The routing decision.
#[derive(Debug, Clone)]
pub struct ModelSelection {
    /// Selected model name.
    pub model: String,
    /// Tier the model was selected from.
    pub tier: ModelTier,
    /// Estimated cost of the call in USD.
    pub estimated_cost: f64,
    /// Whether the budget check downgraded the initial pick.
    pub downgraded: bool,
    /// Reason for the selection.
    pub reason: String,
}

/// Role/complexity/cost triage over the pricing catalog.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    config: RouterConfig,
}

impl ModelRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(RouterConfig::default())
    }

    /// Select a model for the request.
    pub fn route(&self, request: &RouteRequest) -> ModelSelection {
        let tier = if self.config.prefer_cheap {
            ModelTier::Fast
        } else {
            Self::tier_for(request.role, request.complexity)
        };

        let model = pricing::model_for_tier(&self.config.provider, tier);
        let estimated_cost = Self::estimate_cost(request.estimated_tokens, model.blended_per_1m());

        // A call that would eat more than half the remaining budget is
        // downgraded to the provider's fast model.
        if estimated_cost > 0.5 * request.remaining_budget {
            let fast = pricing::model_for_tier(&self.config.provider, ModelTier::Fast);
            let downgraded_cost =
                Self::estimate_cost(request.estimated_tokens, fast.blended_per_1m());
            debug!(
                from = model.name,
                to = fast.name,
                estimated_cost,
                remaining = request.remaining_budget,
                "budget downgrade"
            );
            return ModelSelection {
                model: fast.name.to_string(),
                tier: ModelTier::Fast,
                estimated_cost: downgraded_cost,
                downgraded: true,
                reason: format!(
                    "{:?} would cost {estimated_cost:.6} against remaining budget {:.6}",
                    request.role, request.remaining_budget
                ),
            };
        }

        ModelSelection {
            model: model.name.to_string(),
            tier,
            estimated_cost,
            downgraded: false,
            reason: format!("{:?} at complexity {:.2}", request.role, request.complexity),
        }
    }

    /// Role/complexity tier table.
    fn tier_for(role: AgentRole, complexity: f64) -> ModelTier {
        match role {
            AgentRole::Researcher | AgentRole::UxAgent => ModelTier::Fast,
            AgentRole::Validator => {
                if complexity > 0.7 {
                    ModelTier::Powerful
                } else {
                    ModelTier::Balanced
                }
            }
            AgentRole::Developer => {
                if complexity > 0.5 {
                    ModelTier::Powerful
                } else {
                    ModelTier::Balanced
                }
            }
            AgentRole::Architect | AgentRole::Orchestrator => ModelTier::Powerful,
            AgentRole::Tester => ModelTier::Balanced,
            AgentRole::Generalist => {
                if complexity > 0.6 {
                    ModelTier::Powerful
                } else {
                    ModelTier::Balanced
                }
            }
        }
    }

    /// `tokens / 1e6 × blended price per 1M`.
    fn estimate_cost(tokens: u64, blended_per_1m: f64) -> f64 {
        tokens as f64 / 1_000_000.0 * blended_per_1m
    }
}

/// Monotonic spend gate for one run.
///
/// Budgets in the FinOps engine alert but never block; this gate is the
/// blocking enforcement point callers consult before spending.
#[derive(Debug)]
pub struct BudgetGate {
    limit: f64,
    spent: Mutex<f64>,
}

impl BudgetGate {
    pub fn new(limit: f64) -> Self {
        Self {
            limit,
            spent: Mutex::new(0.0),
        }
    }

    /// Reject an estimate that would cross the limit, without spending.
    pub async fn check_estimate(&self, amount: f64) -> KernelResult<()> {
        let spent = *self.spent.lock().await;
        if spent + amount > self.limit {
            return Err(KernelError::BudgetExceeded {
                attempted: spent + amount,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Record a spend. The increment happens even when the limit is crossed;
    /// the error reports the new total.
    pub async fn spend(&self, amount: f64) -> KernelResult<f64> {
        let mut spent = self.spent.lock().await;
        *spent += amount;
        if *spent > self.limit {
            return Err(KernelError::BudgetExceeded {
                attempted: *spent,
                limit: self.limit,
            });
        }
        Ok(*spent)
    }

    /// Total recorded spend.
    pub async fn spent(&self) -> f64 {
        *self.spent.lock().await
    }

    /// Remaining headroom (never negative).
    pub async fn remaining(&self) -> f64 {
        (self.limit - *self.spent.lock().await).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(role: AgentRole, complexity: f64) -> RouteRequest {
        RouteRequest {
            role,
            complexity,
            estimated_tokens: 10_000,
            remaining_budget: 100.0,
        }
    }

    #[test]
    fn test_role_tier_table() {
        let router = ModelRouter::with_defaults();
        assert_eq!(router.route(&request(AgentRole::Researcher, 0.9)).tier, ModelTier::Fast);
        assert_eq!(router.route(&request(AgentRole::UxAgent, 0.9)).tier, ModelTier::Fast);
        assert_eq!(router.route(&request(AgentRole::Architect, 0.0)).tier, ModelTier::Powerful);
        assert_eq!(router.route(&request(AgentRole::Orchestrator, 0.0)).tier, ModelTier::Powerful);
        assert_eq!(router.route(&request(AgentRole::Tester, 0.9)).tier, ModelTier::Balanced);
    }

    #[test]
    fn test_complexity_thresholds() {
        let router = ModelRouter::with_defaults();
        assert_eq!(router.route(&request(AgentRole::Validator, 0.7)).tier, ModelTier::Balanced);
        assert_eq!(router.route(&request(AgentRole::Validator, 0.71)).tier, ModelTier::Powerful);
        assert_eq!(router.route(&request(AgentRole::Developer, 0.5)).tier, ModelTier::Balanced);
        assert_eq!(router.route(&request(AgentRole::Developer, 0.51)).tier, ModelTier::Powerful);
        assert_eq!(router.route(&request(AgentRole::Generalist, 0.6)).tier, ModelTier::Balanced);
        assert_eq!(router.route(&request(AgentRole::Generalist, 0.61)).tier, ModelTier::Powerful);
    }

    #[test]
    fn test_prefer_cheap_forces_fast() {
        let router = ModelRouter::new(RouterConfig {
            prefer_cheap: true,
            ..Default::default()
        });
        let selection = router.route(&request(AgentRole::Architect, 1.0));
        assert_eq!(selection.tier, ModelTier::Fast);
        assert!(!selection.downgraded);
    }

    #[test]
    fn test_budget_downgrade() {
        let router = ModelRouter::with_defaults();
        let selection = router.route(&RouteRequest {
            role: AgentRole::Developer,
            complexity: 0.8,
            estimated_tokens: 1_000_000,
            remaining_budget: 0.001,
        });
        assert!(selection.downgraded);
        assert_eq!(selection.tier, ModelTier::Fast);
        // 1M tokens at the fast blended price of $2.40/1M.
        assert!((selection.estimated_cost - 2.4).abs() < 1e-9);
    }

    #[test]
    fn test_estimated_cost_formula() {
        let router = ModelRouter::with_defaults();
        let selection = router.route(&RouteRequest {
            role: AgentRole::Developer,
            complexity: 0.8,
            estimated_tokens: 1_000_000,
            remaining_budget: 1_000.0,
        });
        // Powerful blended = (15 + 75) / 2 = 45 per 1M.
        assert!((selection.estimated_cost - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(AgentRole::parse("developer"), AgentRole::Developer);
        assert_eq!(AgentRole::parse("UX-Agent"), AgentRole::UxAgent);
        assert_eq!(AgentRole::parse("wizard"), AgentRole::Generalist);
    }

    #[tokio::test]
    async fn test_budget_gate_check_estimate() {
        let gate = BudgetGate::new(1.0);
        assert!(gate.check_estimate(0.9).await.is_ok());
        assert!(matches!(
            gate.check_estimate(1.1).await,
            Err(KernelError::BudgetExceeded { .. })
        ));
        // Checks never spend.
        assert!(gate.spent().await.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_budget_gate_spend_increments_then_errors() {
        let gate = BudgetGate::new(1.0);
        assert!(gate.spend(0.7).await.is_ok());
        let err = gate.spend(0.5).await.unwrap_err();
        match err {
            KernelError::BudgetExceeded { attempted, limit } => {
                assert!((attempted - 1.2).abs() < 1e-9);
                assert!((limit - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The increment stands even though the call errored.
        assert!((gate.spent().await - 1.2).abs() < 1e-9);
        assert!(gate.remaining().await.abs() < f64::EPSILON);
    }
}

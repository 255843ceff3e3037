//! Static model pricing catalog.
//!
//! Prices are USD per million tokens. Each model carries a tier class used
//! by the router and a capability rank plus downgrade chain used by the
//! rightsizing recommender.

/// Abstract pricing/capability class the router selects before picking a
/// concrete model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    Fast,
    Balanced,
    Powerful,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Powerful => "powerful",
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Catalog entry for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Canonical model name.
    pub name: &'static str,
    /// Provider the model belongs to.
    pub provider: &'static str,
    /// Cost per million input tokens (USD).
    pub input_per_1m: f64,
    /// Cost per million output tokens (USD).
    pub output_per_1m: f64,
    /// Tier class for routing.
    pub tier: ModelTier,
    /// Capability rank, 1 (cheapest) to 5 (most capable).
    pub capability: u8,
    /// Cheaper models to consider in order, nearest first.
    pub downgrades: &'static [&'static str],
}

impl ModelPricing {
    /// Mean of input and output price per million tokens.
    pub fn blended_per_1m(&self) -> f64 {
        (self.input_per_1m + self.output_per_1m) / 2.0
    }

    /// Cost per thousand tokens for a caller-specific input/output mix.
    ///
    /// `mean_input` / `mean_output` are the caller's observed token counts
    /// per call; a zero mix falls back to the blended price.
    pub fn cost_per_1k(&self, mean_input: f64, mean_output: f64) -> f64 {
        let total = mean_input + mean_output;
        if total <= 0.0 {
            return self.blended_per_1m() / 1000.0;
        }
        let per_call =
            (mean_input * self.input_per_1m + mean_output * self.output_per_1m) / 1_000_000.0;
        per_call / total * 1000.0
    }
}

/// Known model pricing (USD per million tokens).
const PRICING_TABLE: &[ModelPricing] = &[
    ModelPricing {
        name: "claude-opus-4-6",
        provider: "anthropic",
        input_per_1m: 15.0,
        output_per_1m: 75.0,
        tier: ModelTier::Powerful,
        capability: 5,
        downgrades: &["claude-sonnet-4-5", "claude-haiku-4-5"],
    },
    ModelPricing {
        name: "claude-sonnet-4-5",
        provider: "anthropic",
        input_per_1m: 3.0,
        output_per_1m: 15.0,
        tier: ModelTier::Balanced,
        capability: 3,
        downgrades: &["claude-haiku-4-5"],
    },
    ModelPricing {
        name: "claude-haiku-4-5",
        provider: "anthropic",
        input_per_1m: 0.80,
        output_per_1m: 4.0,
        tier: ModelTier::Fast,
        capability: 1,
        downgrades: &[],
    },
];

/// The full catalog in listed order.
pub fn catalog() -> &'static [ModelPricing] {
    PRICING_TABLE
}

/// Find pricing for a model by name or alias substring (e.g. "opus" matches
/// "claude-opus-4-6-20250616").
pub fn find_model(model: &str) -> Option<&'static ModelPricing> {
    let model_lower = model.to_lowercase();
    PRICING_TABLE.iter().find(|p| {
        model_lower.contains(p.name) || {
            // Alias match on the family segment ("opus", "sonnet", "haiku").
            p.name
                .split('-')
                .nth(1)
                .is_some_and(|family| model_lower.contains(family))
        }
    })
}

/// Pick a model for `(provider, tier)`, falling back to any model of that
/// provider, then to the first listed model.
pub fn model_for_tier(provider: &str, tier: ModelTier) -> &'static ModelPricing {
    PRICING_TABLE
        .iter()
        .find(|p| p.provider == provider && p.tier == tier)
        .or_else(|| PRICING_TABLE.iter().find(|p| p.provider == provider))
        .unwrap_or(&PRICING_TABLE[0])
}

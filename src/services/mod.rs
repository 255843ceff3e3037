//! Kernel services: the six orchestration components.

pub mod context_manager;
pub mod discovery;
pub mod federation;
pub mod finops;
pub mod forecaster;
pub mod pool;
pub mod pricing;
pub mod rightsizing;
pub mod router;

pub use context_manager::{
    ContextManager, MemoryConfig, MemoryEvent, MemoryStats, RetrieveOptions, ScoredEntry,
    StoreOptions,
};
pub use discovery::{AgentDirectory, DirectoryStats};
pub use federation::{
    FederationConfig, FederationEvent, FederationService, FederationStats, SyncOutcome,
};
pub use finops::{CostAggregate, FinOpsConfig, FinOpsEngine, FinOpsEvent, FinOpsReport};
pub use forecaster::{Forecast, ForecastPeriod};
pub use pool::{ContainerPool, PoolConfig, PoolEvent, PoolStats, SubmitRequest};
pub use pricing::ModelTier;
pub use rightsizing::{Recommendation, RecommendationRule};
pub use router::{AgentRole, BudgetGate, ModelRouter, ModelSelection, RouteRequest, RouterConfig};

//! Domain errors for the CortexOS orchestration kernel.

use thiserror::Error;

/// Domain-level errors raised by the kernel components.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Budget exceeded: {attempted:.6} over limit {limit:.6}")]
    BudgetExceeded { attempted: f64, limit: f64 },

    #[error("Environment {0} not found")]
    EnvironmentNotFound(String),

    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Memory entry not found: {0}")]
    MemoryNotFound(uuid::Uuid),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type KernelResult<T> = Result<T, KernelError>;

impl From<reqwest::Error> for KernelError {
    fn from(err: reqwest::Error) -> Self {
        KernelError::PeerUnreachable(err.to_string())
    }
}

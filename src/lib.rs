//! CortexOS Orchestration Kernel
//!
//! The subsystems that decide what runs, where, for how much, and how
//! failures propagate:
//! - Container/agent pool with FIFO admission and bounded concurrency
//! - Two-tier context memory (MMU) with Q-learning value updates
//! - FinOps engine: consumption ledger, budgets, forecasts, rightsizing
//! - Model router and run budget gate
//! - A2A protocol gateway (HTTP + SSE + push)
//! - CADP federation mesh for agent discovery
//!
//! Everything else (chat surfaces, doc generators, container engines, model
//! providers) is an external collaborator behind the adapter ports in
//! [`domain::ports`]; wiring is explicit via constructor dependencies.

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::{KernelError, KernelResult};
pub use infrastructure::{ConfigLoader, KernelConfig};

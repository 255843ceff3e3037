//! Adapter ports consumed by the kernel.
//!
//! External collaborators (container engines, agent executors, task
//! handlers) plug into the kernel through these traits; the kernel never
//! reaches them through globals.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::errors::KernelResult;
use super::models::{A2aTask, ExecutionEnvironment};

/// Environment variable carrying the task id into a worker.
pub const ENV_TASK_ID: &str = "CORTEXOS_TASK_ID";
/// Environment variable carrying the prompt text into a worker.
pub const ENV_PROMPT: &str = "CORTEXOS_PROMPT";
/// Environment variable carrying the JSON-encoded inputs map into a worker.
pub const ENV_INPUTS: &str = "CORTEXOS_INPUTS";
/// Environment variable carrying the environment id into a worker.
pub const ENV_ENVIRONMENT: &str = "CORTEXOS_ENVIRONMENT";

/// Lifecycle status of a worker container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Timeout,
    Stopped,
}

/// Worker-side view of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Kernel-side identifier.
    pub id: String,
    /// Runtime-native identifier (process id, engine container id, ...).
    pub container_id: String,
    /// Environment the container was created from.
    pub environment_id: String,
    /// Current status.
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of waiting on a container.
#[derive(Debug, Clone, Copy)]
pub struct WaitOutcome {
    pub exit_code: i32,
    pub status: ContainerStatus,
}

/// Options for a container creation request.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerOptions {
    /// Override command (defaults to the environment's command).
    pub command: Option<Vec<String>>,
    /// Host path → guest path mounts.
    pub mounts: HashMap<String, String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Working directory override.
    pub working_dir: Option<String>,
    /// Human-readable container name.
    pub name: Option<String>,
}

/// The worker adapter: a bounded pool drives containers (or in-process
/// agents) exclusively through this interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container for the given environment without starting it.
    async fn create_container(
        &self,
        environment: &ExecutionEnvironment,
        options: CreateContainerOptions,
    ) -> KernelResult<ContainerInfo>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> KernelResult<()>;

    /// Ask a container to stop, waiting up to `grace_seconds` before force
    /// termination.
    async fn stop_container(&self, id: &str, grace_seconds: u64) -> KernelResult<()>;

    /// Remove a container and its resources.
    async fn remove_container(&self, id: &str, force: bool) -> KernelResult<()>;

    /// Wait for the container to finish, up to `timeout_ms` when given.
    ///
    /// On timeout the runtime must force-stop the container, mark it
    /// `Timeout`, and return `KernelError::Timeout`.
    async fn wait_for_container(&self, id: &str, timeout_ms: Option<u64>)
        -> KernelResult<WaitOutcome>;

    /// Collected log output of the container.
    async fn get_container_logs(&self, id: &str) -> KernelResult<String>;

    /// Release every resource held by the runtime (best-effort).
    async fn cleanup(&self, force: bool) -> KernelResult<()>;
}

/// The gateway hands each admitted task to this handler and updates the
/// task from its return value. An `Err` fails the task with the error text.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: A2aTask) -> KernelResult<A2aTask>;
}

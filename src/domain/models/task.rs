//! Pool task domain model.
//!
//! A task is the unit of admission for the container/agent pool. Its status
//! forms a DAG: `Queued → Running → {Completed, Failed, Cancelled}`, with the
//! additional edges `Queued → Failed` (unknown environment) and
//! `Queued → Cancelled` (cancelled before admission).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a pool task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the status DAG allows a transition to `new_status`.
    pub fn can_transition_to(&self, new_status: Self) -> bool {
        match self {
            Self::Queued => matches!(
                new_status,
                Self::Running | Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::Running => new_status.is_terminal(),
            // Terminal states are written once.
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a finished worker run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Worker output text (result frame payload or collected stdout).
    pub output: String,
    /// Process exit code.
    pub exit_code: i32,
    /// Wall-clock duration of the worker run in milliseconds.
    pub duration_ms: u64,
    /// Collected log lines.
    pub logs: Vec<String>,
}

/// A task owned by the container/agent pool for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: Uuid,
    /// Role the task runs under (feeds model routing).
    pub role: String,
    /// Natural-language prompt for the worker.
    pub prompt: String,
    /// Optional structured inputs forwarded to the worker.
    pub inputs: HashMap<String, String>,
    /// Requested execution environment id.
    pub environment_id: String,
    /// Host paths mounted into the worker, `host → guest`.
    pub mounts: HashMap<String, String>,
    /// Current status.
    pub status: TaskStatus,
    /// Container id once a worker has been created for this task.
    pub container_id: Option<String>,
    /// Result of the worker run, set on `Completed` (and on `Failed` when a
    /// run produced output before failing).
    pub result: Option<TaskResult>,
    /// Error message, set on `Failed`.
    pub error: Option<String>,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the task transitioned to `Running`; set iff it ever ran.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new queued task.
    pub fn new(prompt: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: "generalist".to_string(),
            prompt: prompt.into(),
            inputs: HashMap::new(),
            environment_id: environment_id.into(),
            mounts: HashMap::new(),
            status: TaskStatus::Queued,
            container_id: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Set structured inputs.
    pub fn with_inputs(mut self, inputs: HashMap<String, String>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Set mounts.
    pub fn with_mounts(mut self, mounts: HashMap<String, String>) -> Self {
        self.mounts = mounts;
        self
    }

    /// Whether the task has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to a new status, stamping lifecycle timestamps.
    ///
    /// `started_at` is set on the transition into `Running`; `completed_at`
    /// is set on any terminal transition.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "invalid transition from {} to {}",
                self.status, new_status
            ));
        }
        self.status = new_status;
        match new_status {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }
}

//! Task-handler bridge from the A2A gateway to the container pool.
//!
//! Each admitted A2A task becomes one pool submission; the handler waits
//! for the pool task to reach a terminal state and maps its outcome back
//! onto the A2A envelope.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::domain::models::{A2aMessage, A2aTask, A2aTaskState, TaskStatus};
use crate::domain::ports::TaskHandler;
use crate::domain::{KernelError, KernelResult};
use crate::services::{ContainerPool, PoolEvent, SubmitRequest};

/// Interval for the fallback poll when the event stream lags.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Drives A2A tasks through the pool.
#[derive(Clone)]
pub struct PoolTaskHandler {
    pool: ContainerPool,
    environment_id: Option<String>,
}

impl PoolTaskHandler {
    pub fn new(pool: ContainerPool) -> Self {
        Self {
            pool,
            environment_id: None,
        }
    }

    /// Route submissions to a fixed environment instead of the pool default.
    pub fn with_environment(mut self, environment_id: impl Into<String>) -> Self {
        self.environment_id = Some(environment_id.into());
        self
    }
}

#[async_trait]
impl TaskHandler for PoolTaskHandler {
    async fn handle(&self, mut task: A2aTask) -> KernelResult<A2aTask> {
        // The latest user message wins; on an input-required resume that is
        // the freshly appended history entry.
        let prompt = task
            .history
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map_or_else(|| task.input.text_content(), A2aMessage::text_content);

        let mut events = self.pool.subscribe();
        let mut request = SubmitRequest::new(prompt);
        if let Some(environment_id) = &self.environment_id {
            request = request.with_environment(environment_id.clone());
        }
        let submitted = self.pool.submit(request).await;
        debug!(a2a_task = %task.id, pool_task = %submitted.id, "bridged to pool");

        // Wait for the pool task to settle; the event stream signals, the
        // poll covers lagged receivers.
        loop {
            let settled = matches!(
                self.pool.get_task(submitted.id).await,
                Some(t) if t.is_terminal()
            );
            if settled {
                break;
            }
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(
                            PoolEvent::TaskCompleted { task_id }
                            | PoolEvent::TaskFailed { task_id, .. }
                            | PoolEvent::TaskCancelled { task_id },
                        ) if task_id == submitted.id => break,
                        Ok(_) => continue,
                        Err(_) => continue,
                    }
                }
                () = tokio::time::sleep(POLL_INTERVAL) => continue,
            }
        }

        let finished = self
            .pool
            .get_task(submitted.id)
            .await
            .ok_or_else(|| KernelError::TaskNotFound(submitted.id.to_string()))?;

        match finished.status {
            TaskStatus::Completed => {
                let output = finished
                    .result
                    .map(|r| r.output)
                    .unwrap_or_default();
                task.output = Some(A2aMessage::text("agent", output));
                task.status = A2aTaskState::Completed;
                Ok(task)
            }
            TaskStatus::Cancelled => {
                task.status = A2aTaskState::Canceled;
                Ok(task)
            }
            _ => Err(KernelError::HandlerFailure(
                finished
                    .error
                    .unwrap_or_else(|| "worker failed without an error message".to_string()),
            )),
        }
    }
}

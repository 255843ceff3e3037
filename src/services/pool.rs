//! Bounded-concurrency container/agent pool.
//!
//! Tasks are admitted strictly FIFO by submission order; at most
//! `max_containers` run concurrently and the rest wait in the queue.
//! Workers are driven exclusively through the [`ContainerRuntime`] port, so
//! containers and in-process agents are interchangeable behind it.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::{
    EnvironmentRegistry, ExecutionEnvironment, Task, TaskResult, TaskStatus,
};
use crate::domain::ports::{self, ContainerRuntime, CreateContainerOptions};
use crate::domain::KernelError;

/// Runtime configuration for the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrently running workers.
    pub max_containers: usize,
    /// Environment used when a submission names none.
    pub default_environment: String,
    /// Upper bound on any worker run, in milliseconds. The effective wait is
    /// `min(environment.timeout_ms, container_timeout_ms)`.
    pub container_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_containers: 5,
            default_environment: "default".to_string(),
            container_timeout_ms: 300_000,
        }
    }
}

/// Typed lifecycle events emitted by the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    ContainerCreated { task_id: Uuid, container_id: String },
    ContainerStarted { task_id: Uuid, container_id: String },
    TaskCompleted { task_id: Uuid },
    TaskFailed { task_id: Uuid, error: String },
    TaskCancelled { task_id: Uuid },
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_tasks: usize,
    pub queued: usize,
    pub running: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub max_containers: usize,
}

/// A task submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub prompt: String,
    pub role: Option<String>,
    pub environment_id: Option<String>,
    pub inputs: HashMap<String, String>,
    pub mounts: HashMap<String, String>,
}

impl SubmitRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_environment(mut self, environment_id: impl Into<String>) -> Self {
        self.environment_id = Some(environment_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

struct Inner {
    tasks: HashMap<Uuid, Task>,
    queue: VecDeque<Uuid>,
    active: usize,
    /// Running tasks whose slot was already released by `cancel`.
    cancelled_running: HashSet<Uuid>,
    completed: u64,
    failed: u64,
    cancelled: u64,
    shutting_down: bool,
}

/// Bounded FIFO dispatcher for tasks to workers.
#[derive(Clone)]
pub struct ContainerPool {
    config: PoolConfig,
    registry: Arc<EnvironmentRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<PoolEvent>,
    active_tx: Arc<watch::Sender<usize>>,
}

impl ContainerPool {
    pub fn new(
        config: PoolConfig,
        registry: Arc<EnvironmentRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (active_tx, _) = watch::channel(0usize);
        Self {
            config,
            registry,
            runtime,
            inner: Arc::new(Mutex::new(Inner {
                tasks: HashMap::new(),
                queue: VecDeque::new(),
                active: 0,
                cancelled_running: HashSet::new(),
                completed: 0,
                failed: 0,
                cancelled: 0,
                shutting_down: false,
            })),
            events,
            active_tx: Arc::new(active_tx),
        }
    }

    /// Subscribe to pool lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Submit a task. Always succeeds and returns the task in `Queued`;
    /// admission happens immediately when a slot is free.
    pub async fn submit(&self, request: SubmitRequest) -> Task {
        let environment_id = request
            .environment_id
            .unwrap_or_else(|| self.config.default_environment.clone());
        let mut task = Task::new(request.prompt, environment_id)
            .with_inputs(request.inputs)
            .with_mounts(request.mounts);
        if let Some(role) = request.role {
            task.role = role;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.tasks.insert(task.id, task.clone());
            inner.queue.push_back(task.id);
        }
        debug!(task_id = %task.id, "task submitted");

        self.process_queue().await;
        task
    }

    /// Cancel a task. Idempotent; returns `true` when this call moved the
    /// task to `Cancelled`.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let container_id = {
            let mut inner = self.inner.lock().await;
            let Some(task) = inner.tasks.get(&task_id) else {
                return false;
            };
            match task.status {
                TaskStatus::Queued => {
                    inner.queue.retain(|id| *id != task_id);
                    if let Some(task) = inner.tasks.get_mut(&task_id) {
                        let _ = task.transition_to(TaskStatus::Cancelled);
                    }
                    inner.cancelled += 1;
                    let _ = self.events.send(PoolEvent::TaskCancelled { task_id });
                    return true;
                }
                TaskStatus::Running => {
                    let container_id = inner
                        .tasks
                        .get(&task_id)
                        .and_then(|t| t.container_id.clone());
                    if let Some(task) = inner.tasks.get_mut(&task_id) {
                        let _ = task.transition_to(TaskStatus::Cancelled);
                    }
                    // The slot is freed now; the executor sees the marker and
                    // does not release it a second time.
                    inner.cancelled_running.insert(task_id);
                    inner.cancelled += 1;
                    inner.active -= 1;
                    let _ = self.active_tx.send(inner.active);
                    let _ = self.events.send(PoolEvent::TaskCancelled { task_id });
                    container_id
                }
                _ => return false,
            }
        };

        if let Some(container_id) = container_id {
            if let Err(e) = self.runtime.stop_container(&container_id, 5).await {
                warn!(task_id = %task_id, error = %e, "failed to stop cancelled container");
            }
        }
        self.process_queue().await;
        true
    }

    /// Get a task by id.
    pub async fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.inner.lock().await.tasks.get(&task_id).cloned()
    }

    /// All tasks, stably sorted by creation time, newest first.
    pub async fn get_tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks
    }

    /// Point-in-time statistics.
    pub async fn get_stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            total_tasks: inner.tasks.len(),
            queued: inner.queue.len(),
            running: inner.active,
            completed_tasks: inner.completed,
            failed_tasks: inner.failed,
            cancelled_tasks: inner.cancelled,
            max_containers: self.config.max_containers,
        }
    }

    /// Cancel queued tasks, release running resources (best-effort), and
    /// wait until no execution is in flight.
    pub async fn shutdown(&self) {
        info!("shutting down container pool");
        {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;
            while let Some(task_id) = inner.queue.pop_front() {
                if let Some(task) = inner.tasks.get_mut(&task_id) {
                    if task.status == TaskStatus::Queued {
                        let _ = task.transition_to(TaskStatus::Cancelled);
                        inner.cancelled += 1;
                        let _ = self.events.send(PoolEvent::TaskCancelled { task_id });
                    }
                }
            }
        }

        if let Err(e) = self.runtime.cleanup(true).await {
            warn!(error = %e, "runtime cleanup failed during shutdown");
        }

        let mut active_rx = self.active_tx.subscribe();
        while *active_rx.borrow() != 0 {
            if active_rx.changed().await.is_err() {
                break;
            }
        }
        info!("container pool drained");
    }

    /// Admit tasks from the head of the queue until it is empty or every
    /// slot is taken. Cancelled tasks are skipped silently.
    fn process_queue(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.process_queue_inner())
    }

    async fn process_queue_inner(&self) {
        loop {
            let admitted = {
                let mut inner = self.inner.lock().await;
                if inner.shutting_down || inner.active >= self.config.max_containers {
                    return;
                }
                let Some(task_id) = inner.queue.pop_front() else {
                    return;
                };
                let Some((status, environment_id)) = inner
                    .tasks
                    .get(&task_id)
                    .map(|t| (t.status, t.environment_id.clone()))
                else {
                    continue;
                };
                if status != TaskStatus::Queued {
                    continue;
                }

                // Environment resolution failures consume no slot.
                let Some(environment) = self.registry.get(&environment_id).cloned() else {
                    let message = format!("Environment {environment_id} not found");
                    if let Some(task) = inner.tasks.get_mut(&task_id) {
                        task.error = Some(message.clone());
                        let _ = task.transition_to(TaskStatus::Failed);
                    }
                    inner.failed += 1;
                    let _ = self
                        .events
                        .send(PoolEvent::TaskFailed { task_id, error: message });
                    continue;
                };

                let snapshot = match inner.tasks.get_mut(&task_id) {
                    Some(task) => {
                        let _ = task.transition_to(TaskStatus::Running);
                        task.clone()
                    }
                    None => continue,
                };
                inner.active += 1;
                let _ = self.active_tx.send(inner.active);
                Some((snapshot, environment))
            };

            if let Some((task, environment)) = admitted {
                let pool = self.clone();
                tokio::spawn(async move {
                    pool.execute(task, environment).await;
                });
            }
        }
    }

    /// Drive one admitted task through its worker run.
    async fn execute(&self, task: Task, environment: ExecutionEnvironment) {
        let task_id = task.id;
        let outcome = self.run_worker(&task, &environment).await;

        {
            let mut inner = self.inner.lock().await;
            let slot_already_released = inner.cancelled_running.remove(&task_id);
            if !slot_already_released {
                inner.active -= 1;
                let _ = self.active_tx.send(inner.active);
            }

            if let Some(stored) = inner.tasks.get_mut(&task_id) {
                // A cancelled task keeps its terminal state; the worker's
                // result is discarded.
                if stored.status == TaskStatus::Running {
                    match outcome {
                        Ok(result) => {
                            if result.exit_code == 0 {
                                stored.result = Some(result);
                                let _ = stored.transition_to(TaskStatus::Completed);
                                inner.completed += 1;
                                let _ = self.events.send(PoolEvent::TaskCompleted { task_id });
                            } else {
                                let message =
                                    format!("Container exited with code {}", result.exit_code);
                                stored.result = Some(result);
                                stored.error = Some(message.clone());
                                let _ = stored.transition_to(TaskStatus::Failed);
                                inner.failed += 1;
                                let _ = self
                                    .events
                                    .send(PoolEvent::TaskFailed { task_id, error: message });
                            }
                        }
                        Err(e) => {
                            let message = e.to_string();
                            stored.error = Some(message.clone());
                            let _ = stored.transition_to(TaskStatus::Failed);
                            inner.failed += 1;
                            let _ = self
                                .events
                                .send(PoolEvent::TaskFailed { task_id, error: message });
                        }
                    }
                }
            }
        }

        self.process_queue().await;
    }

    /// Create, start, await, and clean up one worker container.
    async fn run_worker(
        &self,
        task: &Task,
        environment: &ExecutionEnvironment,
    ) -> Result<TaskResult, KernelError> {
        let started = std::time::Instant::now();
        // The task reaches the worker through the adapter-contract
        // environment variables (the runtime may additionally frame it onto
        // stdin).
        let mut env = HashMap::new();
        env.insert(ports::ENV_TASK_ID.to_string(), task.id.to_string());
        env.insert(ports::ENV_PROMPT.to_string(), task.prompt.clone());
        env.insert(
            ports::ENV_INPUTS.to_string(),
            serde_json::to_string(&task.inputs).unwrap_or_else(|_| "{}".to_string()),
        );
        env.insert(ports::ENV_ENVIRONMENT.to_string(), environment.id.clone());
        let options = CreateContainerOptions {
            mounts: task.mounts.clone(),
            env,
            name: Some(format!("cortex-{}", task.id)),
            ..Default::default()
        };

        let info = self.runtime.create_container(environment, options).await?;
        {
            let mut inner = self.inner.lock().await;
            if let Some(stored) = inner.tasks.get_mut(&task.id) {
                stored.container_id = Some(info.id.clone());
            }
        }
        let _ = self.events.send(PoolEvent::ContainerCreated {
            task_id: task.id,
            container_id: info.id.clone(),
        });

        self.runtime.start_container(&info.id).await?;
        let _ = self.events.send(PoolEvent::ContainerStarted {
            task_id: task.id,
            container_id: info.id.clone(),
        });

        let timeout_ms = environment.timeout_ms.min(self.config.container_timeout_ms);
        let waited = self
            .runtime
            .wait_for_container(&info.id, Some(timeout_ms))
            .await;

        let logs = match self.runtime.get_container_logs(&info.id).await {
            Ok(logs) => logs,
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "log collection failed");
                String::new()
            }
        };

        // Cleanup is best-effort and never changes the final status.
        if let Err(e) = self.runtime.remove_container(&info.id, true).await {
            warn!(container_id = %info.id, error = %e, "container cleanup failed");
        }

        let wait = waited?;
        Ok(TaskResult {
            output: logs.clone(),
            exit_code: wait.exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            logs: logs.lines().map(str::to_string).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ContainerInfo, ContainerStatus, WaitOutcome};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Runtime stub: every container sleeps `delay_ms` then exits with
    /// `exit_code`; `stop_container` wakes the wait immediately.
    struct StubRuntime {
        delay_ms: u64,
        exit_code: i32,
        stops: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
        peak_concurrent: Arc<AtomicUsize>,
        concurrent: Arc<AtomicUsize>,
    }

    impl StubRuntime {
        fn new(delay_ms: u64, exit_code: i32) -> Self {
            Self {
                delay_ms,
                exit_code,
                stops: Arc::new(Mutex::new(HashMap::new())),
                peak_concurrent: Arc::new(AtomicUsize::new(0)),
                concurrent: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for StubRuntime {
        async fn create_container(
            &self,
            environment: &ExecutionEnvironment,
            _options: CreateContainerOptions,
        ) -> crate::domain::KernelResult<ContainerInfo> {
            let id = Uuid::new_v4().to_string();
            self.stops
                .lock()
                .await
                .insert(id.clone(), Arc::new(Notify::new()));
            Ok(ContainerInfo {
                container_id: format!("stub-{id}"),
                id,
                environment_id: environment.id.clone(),
                status: ContainerStatus::Created,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            })
        }

        async fn start_container(&self, _id: &str) -> crate::domain::KernelResult<()> {
            Ok(())
        }

        async fn stop_container(
            &self,
            id: &str,
            _grace_seconds: u64,
        ) -> crate::domain::KernelResult<()> {
            if let Some(notify) = self.stops.lock().await.get(id) {
                notify.notify_waiters();
            }
            Ok(())
        }

        async fn remove_container(&self, _id: &str, _force: bool) -> crate::domain::KernelResult<()> {
            Ok(())
        }

        async fn wait_for_container(
            &self,
            id: &str,
            _timeout_ms: Option<u64>,
        ) -> crate::domain::KernelResult<WaitOutcome> {
            let notify = self.stops.lock().await.get(id).cloned();
            let running = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_concurrent.fetch_max(running, Ordering::SeqCst);

            let outcome = match notify {
                Some(notify) => {
                    tokio::select! {
                        () = tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)) => {
                            WaitOutcome { exit_code: self.exit_code, status: ContainerStatus::Exited }
                        }
                        () = notify.notified() => {
                            WaitOutcome { exit_code: 137, status: ContainerStatus::Stopped }
                        }
                    }
                }
                None => WaitOutcome {
                    exit_code: self.exit_code,
                    status: ContainerStatus::Exited,
                },
            };
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(outcome)
        }

        async fn get_container_logs(&self, id: &str) -> crate::domain::KernelResult<String> {
            Ok(format!("logs for {id}"))
        }

        async fn cleanup(&self, _force: bool) -> crate::domain::KernelResult<()> {
            for notify in self.stops.lock().await.values() {
                notify.notify_waiters();
            }
            Ok(())
        }
    }

    fn registry() -> Arc<EnvironmentRegistry> {
        let mut registry = EnvironmentRegistry::new();
        registry.register(ExecutionEnvironment::new("default", "/bin/true"));
        Arc::new(registry)
    }

    fn pool_with(max: usize, runtime: StubRuntime) -> ContainerPool {
        ContainerPool::new(
            PoolConfig {
                max_containers: max,
                ..Default::default()
            },
            registry(),
            Arc::new(runtime),
        )
    }

    async fn wait_terminal(pool: &ContainerPool, id: Uuid) -> Task {
        for _ in 0..200 {
            if let Some(task) = pool.get_task(id).await {
                if task.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_fifo_admission_and_completion_order() {
        let runtime = StubRuntime::new(50, 0);
        let peak = runtime.peak_concurrent.clone();
        let pool = pool_with(2, runtime);
        let mut events = pool.subscribe();

        let t1 = pool.submit(SubmitRequest::new("t1")).await;
        let t2 = pool.submit(SubmitRequest::new("t2")).await;
        let t3 = pool.submit(SubmitRequest::new("t3")).await;

        let mut started = Vec::new();
        let mut completed = Vec::new();
        while completed.len() < 3 {
            match events.recv().await {
                Ok(PoolEvent::ContainerStarted { task_id, .. }) => started.push(task_id),
                Ok(PoolEvent::TaskCompleted { task_id }) => completed.push(task_id),
                _ => {}
            }
        }

        // Admission is strict FIFO; t3 only runs after a slot frees up.
        assert_eq!(started, vec![t1.id, t2.id, t3.id]);
        assert_eq!(completed[2], t3.id);
        assert!(completed[0..2].contains(&t1.id) && completed[0..2].contains(&t2.id));
        assert!(peak.load(Ordering::SeqCst) <= 2);

        let stats = pool.get_stats().await;
        assert_eq!(stats.completed_tasks, 3);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let pool = pool_with(1, StubRuntime::new(200, 0));

        let t1 = pool.submit(SubmitRequest::new("t1")).await;
        let t2 = pool.submit(SubmitRequest::new("t2")).await;

        assert!(pool.cancel(t2.id).await);
        assert_eq!(
            pool.get_task(t2.id).await.unwrap().status,
            TaskStatus::Cancelled
        );

        let t1 = wait_terminal(&pool, t1.id).await;
        assert_eq!(t1.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let pool = pool_with(1, StubRuntime::new(50, 0));
        let t1 = pool.submit(SubmitRequest::new("t1")).await;
        wait_terminal(&pool, t1.id).await;
        assert!(!pool.cancel(t1.id).await);
        assert!(!pool.cancel(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_cancel_running_releases_slot() {
        let pool = pool_with(1, StubRuntime::new(10_000, 0));

        let t1 = pool.submit(SubmitRequest::new("t1")).await;
        let t2 = pool.submit(SubmitRequest::new("t2")).await;
        // Let t1 start.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(pool.cancel(t1.id).await);
        assert_eq!(
            pool.get_task(t1.id).await.unwrap().status,
            TaskStatus::Cancelled
        );

        // The freed slot admits t2 from the queue head.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(
            pool.get_task(t2.id).await.unwrap().status,
            TaskStatus::Running
        );
        let stats = pool.get_stats().await;
        assert_eq!(stats.running, 1);
        assert_eq!(stats.cancelled_tasks, 1);
    }

    #[tokio::test]
    async fn test_unknown_environment_fails_without_slot() {
        let pool = pool_with(1, StubRuntime::new(50, 0));
        let task = pool
            .submit(SubmitRequest::new("nope").with_environment("missing"))
            .await;

        let task = wait_terminal(&pool, task.id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Environment missing not found"));
        assert!(task.started_at.is_none());

        let stats = pool.get_stats().await;
        assert_eq!(stats.running, 0);
        assert_eq!(stats.failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_task() {
        let pool = pool_with(1, StubRuntime::new(10, 3));
        let task = pool.submit(SubmitRequest::new("boom")).await;

        let task = wait_terminal(&pool, task.id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Container exited with code 3"));
        assert_eq!(task.result.as_ref().unwrap().exit_code, 3);
    }

    #[tokio::test]
    async fn test_get_tasks_sorted_newest_first() {
        let pool = pool_with(2, StubRuntime::new(10, 0));
        let t1 = pool.submit(SubmitRequest::new("t1")).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let t2 = pool.submit(SubmitRequest::new("t2")).await;

        let tasks = pool.get_tasks().await;
        assert_eq!(tasks[0].id, t2.id);
        assert_eq!(tasks[1].id, t1.id);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_and_drains() {
        let pool = pool_with(1, StubRuntime::new(5_000, 0));
        let _t1 = pool.submit(SubmitRequest::new("t1")).await;
        let t2 = pool.submit(SubmitRequest::new("t2")).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        pool.shutdown().await;

        let stats = pool.get_stats().await;
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(
            pool.get_task(t2.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }
}

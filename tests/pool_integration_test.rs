//! Pool lifecycle against real worker processes.

mod common;

use std::time::Duration;

use cortex_kernel::domain::models::TaskStatus;
use cortex_kernel::services::{PoolEvent, SubmitRequest};

async fn wait_terminal(
    pool: &cortex_kernel::services::ContainerPool,
    id: uuid::Uuid,
) -> cortex_kernel::domain::models::Task {
    for _ in 0..400 {
        if let Some(task) = pool.get_task(id).await {
            if task.is_terminal() {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never settled");
}

#[tokio::test]
async fn pool_runs_shell_workers_fifo() {
    let pool = common::process_pool(2, "sleep 0.05; echo done");
    let mut events = pool.subscribe();

    let t1 = pool.submit(SubmitRequest::new("t1")).await;
    let t2 = pool.submit(SubmitRequest::new("t2")).await;
    let t3 = pool.submit(SubmitRequest::new("t3")).await;

    let mut started = Vec::new();
    let mut completions = Vec::new();
    while completions.len() < 3 {
        match events.recv().await {
            Ok(PoolEvent::ContainerStarted { task_id, .. }) => started.push(task_id),
            Ok(PoolEvent::TaskCompleted { task_id }) => completions.push(task_id),
            Ok(PoolEvent::TaskFailed { task_id, error }) => {
                panic!("task {task_id} failed: {error}")
            }
            _ => {}
        }
    }
    // FIFO admission; the third task waits for a freed slot.
    assert_eq!(started, vec![t1.id, t2.id, t3.id]);
    assert_eq!(completions[2], t3.id);

    let stats = pool.get_stats().await;
    assert_eq!(stats.completed_tasks, 3);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.queued, 0);

    let done = pool.get_task(t1.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.output.contains("done"));
    assert!(done.started_at.unwrap() <= done.completed_at.unwrap());
}

#[tokio::test]
async fn pool_reports_worker_failure() {
    let pool = common::process_pool(1, "echo broken >&2; exit 9");
    let task = pool.submit(SubmitRequest::new("broken")).await;

    let task = wait_terminal(&pool, task.id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Container exited with code 9"));
}

#[tokio::test]
async fn pool_times_out_hanging_worker() {
    let mut registry = cortex_kernel::domain::models::EnvironmentRegistry::new();
    registry.register(
        cortex_kernel::domain::models::ExecutionEnvironment::new("default", "/bin/sh")
            .with_args(vec!["-c".to_string(), "sleep 30".to_string()])
            .with_timeout_ms(200),
    );
    let pool = cortex_kernel::services::ContainerPool::new(
        cortex_kernel::services::PoolConfig::default(),
        std::sync::Arc::new(registry),
        std::sync::Arc::new(cortex_kernel::adapters::worker::ProcessWorker::new()),
    );

    let started = std::time::Instant::now();
    let task = pool.submit(SubmitRequest::new("hang")).await;
    let task = wait_terminal(&pool, task.id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap_or_default().contains("Timeout"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(pool.get_stats().await.running, 0);
}

#[tokio::test]
async fn pool_cancel_queued_then_first_completes() {
    let pool = common::process_pool(1, "sleep 0.2; echo ok");

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
async fn pool_shutdown_waits_for_inflight() {
    let pool = common::process_pool(1, "sleep 0.3; echo late");
    let t1 = pool.submit(SubmitRequest::new("t1")).await;
    let t2 = pool.submit(SubmitRequest::new("t2")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.shutdown().await;

    let stats = pool.get_stats().await;
    assert_eq!(stats.running, 0);
    // The queued task was cancelled; the in-flight one settled either way.
    assert_eq!(
        pool.get_task(t2.id).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert!(pool.get_task(t1.id).await.unwrap().is_terminal());
}

#[tokio::test]
async fn pool_task_inputs_reach_worker_env() {
    let pool = cortex_kernel::services::ContainerPool::new(
        cortex_kernel::services::PoolConfig::default(),
        common::shell_registry("printf '%s' \"$CORTEXOS_PROMPT\""),
        std::sync::Arc::new(cortex_kernel::adapters::worker::ProcessWorker::new()),
    );

    let task = pool
        .submit(
            SubmitRequest::new("hello from the kernel")
                .with_role("developer"),
        )
        .await;
    let task = wait_terminal(&pool, task.id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.unwrap().output, "hello from the kernel");
}

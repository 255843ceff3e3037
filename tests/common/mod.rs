//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;

use cortex_kernel::adapters::http::{A2aGateway, GatewayConfig};
use cortex_kernel::adapters::worker::ProcessWorker;
use cortex_kernel::domain::models::{
    A2aMessage, A2aTask, A2aTaskState, EnvironmentRegistry, ExecutionEnvironment,
};
use cortex_kernel::domain::ports::TaskHandler;
use cortex_kernel::domain::KernelResult;
use cortex_kernel::services::{ContainerPool, PoolConfig};

/// Registry with a single `default` shell environment running `script`.
pub fn shell_registry(script: &str) -> Arc<EnvironmentRegistry> {
    let mut registry = EnvironmentRegistry::new();
    registry.register(
        ExecutionEnvironment::new("default", "/bin/sh")
            .with_args(vec!["-c".to_string(), script.to_string()])
            .with_timeout_ms(10_000),
    );
    Arc::new(registry)
}

/// Pool over real processes.
pub fn process_pool(max_containers: usize, script: &str) -> ContainerPool {
    ContainerPool::new(
        PoolConfig {
            max_containers,
            ..Default::default()
        },
        shell_registry(script),
        Arc::new(ProcessWorker::new()),
    )
}

/// Handler that sleeps then completes with a fixed reply.
pub struct SleepHandler {
    pub delay: Duration,
    pub reply: String,
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn handle(&self, mut task: A2aTask) -> KernelResult<A2aTask> {
        tokio::time::sleep(self.delay).await;
        task.output = Some(A2aMessage::text("agent", self.reply.clone()));
        task.status = A2aTaskState::Completed;
        Ok(task)
    }
}

/// Handler that asks for input on the first dispatch and completes on the
/// second, echoing the provided input back.
pub struct InputOnceHandler {
    pub calls: Arc<AtomicUsize>,
}

impl InputOnceHandler {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl TaskHandler for InputOnceHandler {
    async fn handle(&self, mut task: A2aTask) -> KernelResult<A2aTask> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            task.status = A2aTaskState::InputRequired;
            task.output = Some(A2aMessage::text("agent", "which flavor?"));
        } else {
            let answer = task
                .history
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(A2aMessage::text_content)
                .unwrap_or_default();
            task.status = A2aTaskState::Completed;
            task.output = Some(A2aMessage::text("agent", format!("served: {answer}")));
        }
        Ok(task)
    }
}

/// Serve a gateway on an ephemeral port; returns its base URL.
pub async fn spawn_gateway(
    config: GatewayConfig,
    handler: Arc<dyn TaskHandler>,
) -> (String, A2aGateway) {
    let gateway = A2aGateway::new(config, handler);
    let router = gateway.build_router();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), gateway)
}

/// Build a task-creation body with one text part.
pub fn task_body(prompt: &str) -> serde_json::Value {
    serde_json::json!({
        "message": { "role": "user", "parts": [ { "type": "text", "text": prompt } ] }
    })
}

/// Map of string pairs, for inputs/mounts helpers.
pub fn string_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

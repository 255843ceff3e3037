//! A2A protocol gateway.
//!
//! Public HTTP surface that accepts tasks, drives their state machine
//! through a pluggable [`TaskHandler`], and fans lifecycle updates out to
//! SSE subscribers and registered push webhooks. Task-map writes are
//! serialized behind one lock; handler execution and outbound notification
//! always happen outside it.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::domain::models::{
    A2aMessage, A2aTask, A2aTaskState, AgentCapabilities, AgentCard, AgentSkill, PushRegistration,
};
use crate::domain::ports::TaskHandler;

/// Hard deadline on outbound push notifications.
const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub hostname: String,
    /// Ceiling on concurrently live (non-terminal) tasks.
    pub max_concurrent_tasks: usize,
    /// Handler deadline per dispatch, in milliseconds.
    pub task_timeout_ms: u64,
    /// Agent card identity.
    pub agent_name: String,
    pub agent_description: String,
    pub agent_version: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 3200,
            hostname: "0.0.0.0".to_string(),
            max_concurrent_tasks: 10,
            task_timeout_ms: 300_000,
            agent_name: "cortex-kernel".to_string(),
            agent_description: "CortexOS orchestration kernel".to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Point-in-time gateway statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub active_tasks: usize,
    pub total_tasks: usize,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub push_delivered: u64,
    pub push_failed: u64,
}

/// One lifecycle update fanned out to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskUpdate {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub status: A2aTaskState,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<A2aMessage>,
}

struct TaskEntry {
    task: A2aTask,
    updates: broadcast::Sender<TaskUpdate>,
    push: Vec<PushRegistration>,
}

struct Inner {
    tasks: HashMap<String, TaskEntry>,
    /// Non-terminal task count; gates admission.
    active: usize,
    completed: u64,
    failed: u64,
    canceled: u64,
}

/// Shared gateway state.
pub struct GatewayState {
    config: GatewayConfig,
    handler: Arc<dyn TaskHandler>,
    inner: RwLock<Inner>,
    push_client: reqwest::Client,
    push_delivered: AtomicU64,
    push_failed: AtomicU64,
}

impl GatewayState {
    /// Point-in-time statistics.
    pub async fn stats(&self) -> GatewayStats {
        let inner = self.inner.read().await;
        GatewayStats {
            active_tasks: inner.active,
            total_tasks: inner.tasks.len(),
            completed: inner.completed,
            failed: inner.failed,
            canceled: inner.canceled,
            push_delivered: self.push_delivered.load(Ordering::Relaxed),
            push_failed: self.push_failed.load(Ordering::Relaxed),
        }
    }

    /// Get a task snapshot.
    pub async fn get_task(&self, id: &str) -> Option<A2aTask> {
        self.inner.read().await.tasks.get(id).map(|e| e.task.clone())
    }
}

// ----------------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------------

/// Body of `POST /a2a/tasks`.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub message: A2aMessage,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Body of `POST /a2a/tasks/{id}/input`.
#[derive(Debug, Deserialize)]
pub struct ProvideInputRequest {
    pub message: A2aMessage,
}

/// Task summary returned by the list endpoint.
#[derive(Debug, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub status: A2aTaskState,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Error envelope for every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ----------------------------------------------------------------------------
// Gateway
// ----------------------------------------------------------------------------

/// The A2A HTTP gateway.
#[derive(Clone)]
pub struct A2aGateway {
    state: Arc<GatewayState>,
}

impl A2aGateway {
    pub fn new(config: GatewayConfig, handler: Arc<dyn TaskHandler>) -> Self {
        let push_client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            state: Arc::new(GatewayState {
                config,
                handler,
                inner: RwLock::new(Inner {
                    tasks: HashMap::new(),
                    active: 0,
                    completed: 0,
                    failed: 0,
                    canceled: 0,
                }),
                push_client,
                push_delivered: AtomicU64::new(0),
                push_failed: AtomicU64::new(0),
            }),
        }
    }

    /// Shared state handle (stats and task reads).
    pub fn state(&self) -> Arc<GatewayState> {
        Arc::clone(&self.state)
    }

    /// Build the router.
    pub fn build_router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::DELETE,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers(Any);

        Router::new()
            .route("/.well-known/agent.json", get(agent_card))
            .route("/a2a/tasks", post(create_task).get(list_tasks))
            .route("/a2a/tasks/{id}", get(get_task))
            .route("/a2a/tasks/{id}/cancel", post(cancel_task))
            .route("/a2a/tasks/{id}/input", post(provide_input))
            .route("/a2a/tasks/{id}/subscribe", get(subscribe_task))
            .route("/a2a/tasks/{id}/push", post(register_push))
            .route("/a2a/health", get(health))
            .with_state(self.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until the process ends.
    pub async fn serve(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = format!("{}:{}", self.state.config.hostname, self.state.config.port)
            .parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("A2A gateway listening on {addr}");
        axum::serve(listener, self.build_router()).await?;
        Ok(())
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(
        &self,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!("{}:{}", self.state.config.hostname, self.state.config.port)
            .parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("A2A gateway listening on {addr}");
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Admit a task and start driving it. `Err` carries the refusal.
    pub async fn submit(&self, input: A2aMessage) -> Result<A2aTask, Response> {
        if input.parts.is_empty() {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "EMPTY_MESSAGE",
                "message requires at least one part",
            ));
        }

        let task = {
            let mut inner = self.state.inner.write().await;
            if inner.active >= self.state.config.max_concurrent_tasks {
                return Err(error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "CAPACITY",
                    format!(
                        "gateway at capacity ({} active tasks)",
                        self.state.config.max_concurrent_tasks
                    ),
                ));
            }
            let task = A2aTask::new(input);
            let (updates, _) = broadcast::channel(64);
            inner.tasks.insert(
                task.id.clone(),
                TaskEntry {
                    task: task.clone(),
                    updates,
                    push: Vec::new(),
                },
            );
            inner.active += 1;
            task
        };

        self.dispatch(task.id.clone()).await;
        Ok(task)
    }

    /// Transition a task to `working` and run the handler against it with
    /// the configured deadline.
    async fn dispatch(&self, task_id: String) {
        let Some(snapshot) = self
            .apply_transition(&task_id, A2aTaskState::Working, None)
            .await
        else {
            return;
        };

        let gateway = self.clone();
        tokio::spawn(async move {
            let deadline = Duration::from_millis(gateway.state.config.task_timeout_ms);
            let handled =
                tokio::time::timeout(deadline, gateway.state.handler.handle(snapshot)).await;

            match handled {
                Err(_) => {
                    // Still working at the deadline: fail exactly once.
                    debug!(task_id = %task_id, "task timed out");
                    gateway
                        .apply_transition(
                            &task_id,
                            A2aTaskState::Failed,
                            Some(A2aMessage::text("agent", "Task timed out")),
                        )
                        .await;
                }
                Ok(Err(e)) => {
                    gateway
                        .apply_transition(
                            &task_id,
                            A2aTaskState::Failed,
                            Some(A2aMessage::text("agent", e.to_string())),
                        )
                        .await;
                }
                Ok(Ok(returned)) => {
                    // A handler that leaves the task non-terminal and not
                    // input-required has completed its work.
                    let next = match returned.status {
                        A2aTaskState::Submitted | A2aTaskState::Working => A2aTaskState::Completed,
                        status => status,
                    };
                    gateway.apply_handler_result(&task_id, next, returned).await;
                }
            }
        });
    }

    /// Apply a handler's returned status, output, and artifacts.
    async fn apply_handler_result(&self, task_id: &str, next: A2aTaskState, returned: A2aTask) {
        let update = {
            let mut inner = self.state.inner.write().await;
            let Some(entry) = inner.tasks.get_mut(task_id) else {
                return;
            };
            // A cancelled (or otherwise terminal) task ignores the handler.
            if entry.task.status.is_terminal() || entry.task.transition_to(next).is_err() {
                return;
            }
            entry.task.output = returned.output;
            entry.task.artifacts = returned.artifacts;
            if returned.history.len() > entry.task.history.len() {
                entry.task.history = returned.history;
            }
            let update = TaskUpdate {
                task_id: task_id.to_string(),
                status: entry.task.status,
                updated_at: entry.task.updated_at,
                output: entry.task.output.clone(),
            };
            count_terminal(&mut inner, next);
            update
        };
        self.notify(task_id, update).await;
    }

    /// Transition a task, returning the post-transition snapshot.
    async fn apply_transition(
        &self,
        task_id: &str,
        next: A2aTaskState,
        output: Option<A2aMessage>,
    ) -> Option<A2aTask> {
        let (snapshot, update) = {
            let mut inner = self.state.inner.write().await;
            let entry = inner.tasks.get_mut(task_id)?;
            if entry.task.transition_to(next).is_err() {
                return None;
            }
            if let Some(output) = output {
                entry.task.output = Some(output);
            }
            let update = TaskUpdate {
                task_id: task_id.to_string(),
                status: entry.task.status,
                updated_at: entry.task.updated_at,
                output: entry.task.output.clone(),
            };
            let snapshot = entry.task.clone();
            count_terminal(&mut inner, next);
            (snapshot, update)
        };
        self.notify(task_id, update).await;
        Some(snapshot)
    }

    /// Fan an update out to SSE subscribers and matching push webhooks.
    async fn notify(&self, task_id: &str, update: TaskUpdate) {
        let (sender, targets, task) = {
            let inner = self.state.inner.read().await;
            let Some(entry) = inner.tasks.get(task_id) else {
                return;
            };
            let targets: Vec<PushRegistration> = entry
                .push
                .iter()
                .filter(|p| p.matches(update.status))
                .cloned()
                .collect();
            (entry.updates.clone(), targets, entry.task.clone())
        };

        // SSE delivery; a lagging or gone subscriber is its own problem.
        let _ = sender.send(update);

        // Push is fire-and-forget: one attempt, five-second timeout.
        for target in targets {
            let client = self.state.push_client.clone();
            let task = task.clone();
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                match client.post(&target.url).json(&task).send().await {
                    Ok(response) if response.status().is_success() => {
                        state.push_delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(response) => {
                        state.push_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(url = %target.url, status = %response.status(), "push rejected");
                    }
                    Err(e) => {
                        state.push_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(url = %target.url, error = %e, "push failed");
                    }
                }
            });
        }
    }
}

fn count_terminal(inner: &mut Inner, state: A2aTaskState) {
    if state.is_terminal() {
        inner.active = inner.active.saturating_sub(1);
        match state {
            A2aTaskState::Completed => inner.completed += 1,
            A2aTaskState::Failed => inner.failed += 1,
            A2aTaskState::Canceled => inner.canceled += 1,
            _ => {}
        }
    }
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

async fn agent_card(State(gateway): State<A2aGateway>) -> Json<AgentCard> {
    let config = &gateway.state.config;
    Json(AgentCard {
        name: config.agent_name.clone(),
        description: config.agent_description.clone(),
        version: config.agent_version.clone(),
        url: format!("http://{}:{}/a2a", config.hostname, config.port),
        capabilities: AgentCapabilities {
            streaming: true,
            push_notifications: true,
            state_transition_history: true,
        },
        skills: vec![AgentSkill {
            id: "orchestrate".to_string(),
            name: "Task orchestration".to_string(),
            description: Some("Routes natural-language tasks to pooled workers".to_string()),
            tags: vec!["orchestration".to_string()],
        }],
        default_input_modes: vec!["text".to_string()],
        default_output_modes: vec!["text".to_string()],
    })
}

async fn health(State(gateway): State<A2aGateway>) -> Json<serde_json::Value> {
    let stats = gateway.state.stats().await;
    Json(json!({
        "status": "ok",
        "activeTasks": stats.active_tasks,
        "totalTasks": stats.total_tasks,
    }))
}

async fn create_task(
    State(gateway): State<A2aGateway>,
    Json(request): Json<CreateTaskRequest>,
) -> Response {
    match gateway.submit(request.message).await {
        Ok(mut task) => {
            if let Some(metadata) = request.metadata {
                task.metadata = Some(metadata.clone());
                let mut inner = gateway.state.inner.write().await;
                if let Some(entry) = inner.tasks.get_mut(&task.id) {
                    entry.task.metadata = Some(metadata);
                }
            }
            (StatusCode::CREATED, Json(task)).into_response()
        }
        Err(response) => response,
    }
}

async fn list_tasks(State(gateway): State<A2aGateway>) -> Json<Vec<TaskSummary>> {
    let inner = gateway.state.inner.read().await;
    let mut summaries: Vec<TaskSummary> = inner
        .tasks
        .values()
        .map(|e| TaskSummary {
            id: e.task.id.clone(),
            status: e.task.status,
            created_at: e.task.created_at,
            updated_at: e.task.updated_at,
        })
        .collect();
    summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
    Json(summaries)
}

async fn get_task(
    State(gateway): State<A2aGateway>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let wants_stream = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));
    if wants_stream {
        return match task_stream(&gateway, &id).await {
            Some(sse) => sse.into_response(),
            None => {
                error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("task {id} not found"))
            }
        };
    }
    match gateway.state.get_task(&id).await {
        Some(task) => Json(task).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("task {id} not found")),
    }
}

async fn cancel_task(State(gateway): State<A2aGateway>, Path(id): Path<String>) -> Response {
    let current = {
        let inner = gateway.state.inner.read().await;
        inner.tasks.get(&id).map(|e| e.task.status)
    };
    match current {
        None => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("task {id} not found")),
        Some(status) if status.is_terminal() => error_response(
            StatusCode::BAD_REQUEST,
            "TERMINAL",
            format!("task {id} is already {status}"),
        ),
        Some(_) => match gateway
            .apply_transition(&id, A2aTaskState::Canceled, None)
            .await
        {
            Some(task) => Json(task).into_response(),
            None => error_response(
                StatusCode::BAD_REQUEST,
                "TERMINAL",
                format!("task {id} can no longer be canceled"),
            ),
        },
    }
}

async fn provide_input(
    State(gateway): State<A2aGateway>,
    Path(id): Path<String>,
    Json(request): Json<ProvideInputRequest>,
) -> Response {
    {
        let mut inner = gateway.state.inner.write().await;
        let Some(entry) = inner.tasks.get_mut(&id) else {
            return error_response(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("task {id} not found"),
            );
        };
        if entry.task.status != A2aTaskState::InputRequired {
            return error_response(
                StatusCode::BAD_REQUEST,
                "NOT_WAITING",
                format!("task {id} is {} and does not accept input", entry.task.status),
            );
        }
        entry.task.history.push(request.message);
    }
    // input-required → working re-reads the appended history.
    gateway.dispatch(id.clone()).await;
    match gateway.state.get_task(&id).await {
        Some(task) => Json(task).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("task {id} not found")),
    }
}

async fn subscribe_task(State(gateway): State<A2aGateway>, Path(id): Path<String>) -> Response {
    match task_stream(&gateway, &id).await {
        Some(sse) => sse.into_response(),
        None => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("task {id} not found")),
    }
}

async fn register_push(
    State(gateway): State<A2aGateway>,
    Path(id): Path<String>,
    Json(registration): Json<PushRegistration>,
) -> Response {
    let mut inner = gateway.state.inner.write().await;
    let Some(entry) = inner.tasks.get_mut(&id) else {
        return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("task {id} not found"));
    };
    entry.push.push(registration);
    (StatusCode::CREATED, Json(json!({ "registered": true }))).into_response()
}

/// Build the SSE stream for one task: current state first, then every
/// update in order, ending after a terminal one.
async fn task_stream(
    gateway: &A2aGateway,
    id: &str,
) -> Option<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (receiver, snapshot) = {
        let inner = gateway.state.inner.read().await;
        let entry = inner.tasks.get(id)?;
        (entry.updates.subscribe(), entry.task.clone())
    };

    let initial = TaskUpdate {
        task_id: snapshot.id.clone(),
        status: snapshot.status,
        updated_at: snapshot.updated_at,
        output: snapshot.output.clone(),
    };

    // Current state first, then every update in arrival order; the stream
    // ends once a terminal update has been delivered.
    let stream = futures::stream::unfold(
        (receiver, Some(initial), false),
        |(mut receiver, pending, done)| async move {
            if done {
                return None;
            }
            if let Some(update) = pending {
                let is_terminal = update.status.is_terminal();
                return Some((Ok(sse_event(&update)), (receiver, None, is_terminal)));
            }
            loop {
                match receiver.recv().await {
                    Ok(update) => {
                        let is_terminal = update.status.is_terminal();
                        return Some((Ok(sse_event(&update)), (receiver, None, is_terminal)));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );
    Some(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(update: &TaskUpdate) -> Event {
    Event::default()
        .event("task-update")
        .data(serde_json::to_string(update).unwrap_or_else(|_| "{}".to_string()))
}

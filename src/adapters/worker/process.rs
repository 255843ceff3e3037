//! Reference process worker.
//!
//! Implements the [`ContainerRuntime`] port by spawning local processes and
//! driving them through the stdin/stdout NDJSON framing. This is the
//! in-process stand-in used by `cortexd` and the test suites; a real
//! container engine is an external collaborator behind the same port.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{self, ExecutePayload, WorkerEvent};
use crate::domain::models::ExecutionEnvironment;
use crate::domain::ports::{
    ContainerInfo, ContainerRuntime, ContainerStatus, CreateContainerOptions, WaitOutcome,
};
use crate::domain::{KernelError, KernelResult};

struct ManagedProcess {
    info: ContainerInfo,
    environment: ExecutionEnvironment,
    options: CreateContainerOptions,
    child: Option<Child>,
    /// Stdout drain task; joined before logs are considered complete.
    reader: Option<tokio::task::JoinHandle<()>>,
    logs: Arc<Mutex<Vec<String>>>,
    kill: Arc<Notify>,
}

/// Process-backed worker runtime.
#[derive(Clone, Default)]
pub struct ProcessWorker {
    processes: Arc<RwLock<HashMap<String, ManagedProcess>>>,
}

impl ProcessWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the execute payload from the adapter-contract env variables.
    fn payload_from_options(
        environment: &ExecutionEnvironment,
        options: &CreateContainerOptions,
    ) -> ExecutePayload {
        let inputs: HashMap<String, String> = options
            .env
            .get(protocol::ENV_INPUTS)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        ExecutePayload::new(
            options
                .env
                .get(protocol::ENV_TASK_ID)
                .cloned()
                .unwrap_or_default(),
            options
                .env
                .get(protocol::ENV_PROMPT)
                .cloned()
                .unwrap_or_default(),
            inputs,
            options
                .env
                .get(protocol::ENV_ENVIRONMENT)
                .cloned()
                .unwrap_or_else(|| environment.id.clone()),
        )
    }

    /// Wait briefly for the stdout drain to finish.
    async fn join_reader(reader: Option<tokio::task::JoinHandle<()>>) {
        if let Some(reader) = reader {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), reader).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for ProcessWorker {
    async fn create_container(
        &self,
        environment: &ExecutionEnvironment,
        options: CreateContainerOptions,
    ) -> KernelResult<ContainerInfo> {
        let id = Uuid::new_v4().to_string();
        let info = ContainerInfo {
            id: id.clone(),
            container_id: String::new(),
            environment_id: environment.id.clone(),
            status: ContainerStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let mut processes = self.processes.write().await;
        processes.insert(
            id,
            ManagedProcess {
                info: info.clone(),
                environment: environment.clone(),
                options,
                child: None,
                reader: None,
                logs: Arc::new(Mutex::new(Vec::new())),
                kill: Arc::new(Notify::new()),
            },
        );
        Ok(info)
    }

    async fn start_container(&self, id: &str) -> KernelResult<()> {
        let mut processes = self.processes.write().await;
        let managed = processes
            .get_mut(id)
            .ok_or_else(|| KernelError::Worker(format!("container {id} not found")))?;
        if managed.child.is_some() {
            return Err(KernelError::Worker(format!("container {id} already started")));
        }

        let command = managed
            .options
            .command
            .clone()
            .unwrap_or_else(|| {
                let mut command = vec![managed.environment.command.clone()];
                command.extend(managed.environment.args.clone());
                command
            });
        let Some((program, args)) = command.split_first() else {
            return Err(KernelError::Worker("environment has no command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&managed.environment.env)
            .envs(&managed.options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = managed
            .options
            .working_dir
            .as_ref()
            .or(managed.environment.working_dir.as_ref())
        {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| KernelError::Worker(format!("failed to spawn worker: {e}")))?;
        managed.info.container_id = child.id().map(|pid| pid.to_string()).unwrap_or_default();
        managed.info.status = ContainerStatus::Running;
        managed.info.started_at = Some(Utc::now());

        // Frame the task onto stdin, then close it so the worker sees EOF.
        // The write happens off the state lock; a worker that never reads
        // stdin is its own business.
        let payload = Self::payload_from_options(&managed.environment, &managed.options);
        if let Some(mut stdin) = child.stdin.take() {
            let mut line = serde_json::to_string(&payload)?;
            line.push('\n');
            let container = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!(container = %container, error = %e, "worker did not read stdin payload");
                }
            });
        }

        // Drain stdout into the log buffer as frames arrive.
        if let Some(stdout) = child.stdout.take() {
            let logs = managed.logs.clone();
            let container = id.to_string();
            managed.reader = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match protocol::parse_line(&line) {
                        Some(WorkerEvent::Log { message, .. }) => {
                            logs.lock().await.push(message);
                        }
                        Some(WorkerEvent::Progress { stage, percent, .. }) => {
                            debug!(container = %container, stage = %stage, percent, "worker progress");
                        }
                        Some(WorkerEvent::Result { output, .. }) => {
                            if !output.is_empty() {
                                logs.lock().await.push(output);
                            }
                        }
                        None => {}
                    }
                }
            }));
        }

        managed.child = Some(child);
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace_seconds: u64) -> KernelResult<()> {
        let mut processes = self.processes.write().await;
        let managed = processes
            .get_mut(id)
            .ok_or_else(|| KernelError::Worker(format!("container {id} not found")))?;
        // Wake any waiter so it performs the kill; if nobody is waiting,
        // kill the child directly.
        managed.kill.notify_waiters();
        if let Some(child) = managed.child.as_mut() {
            let _ = child.start_kill();
        }
        managed.info.status = ContainerStatus::Stopped;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> KernelResult<()> {
        let mut processes = self.processes.write().await;
        let still_running = processes
            .get_mut(id)
            .and_then(|m| m.child.as_mut())
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)));
        if still_running && !force {
            return Err(KernelError::Worker(format!(
                "container {id} is still running"
            )));
        }
        if let Some(mut managed) = processes.remove(id) {
            if let Some(child) = managed.child.as_mut() {
                let _ = child.start_kill();
            }
        }
        Ok(())
    }

    async fn wait_for_container(
        &self,
        id: &str,
        timeout_ms: Option<u64>,
    ) -> KernelResult<WaitOutcome> {
        let (mut child, kill) = {
            let mut processes = self.processes.write().await;
            let managed = processes
                .get_mut(id)
                .ok_or_else(|| KernelError::Worker(format!("container {id} not found")))?;
            let child = managed
                .child
                .take()
                .ok_or_else(|| KernelError::Worker(format!("container {id} not started")))?;
            (child, managed.kill.clone())
        };

        // Race process exit against a stop request; the borrow of `child`
        // ends with this block so the timeout path below can still kill it.
        let waited = {
            let wait = async {
                let outcome = tokio::select! {
                    status = child.wait() => Some(status),
                    () = kill.notified() => None,
                };
                match outcome {
                    Some(status) => status,
                    None => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                }
            };
            tokio::pin!(wait);
            match timeout_ms {
                Some(timeout_ms) => {
                    tokio::time::timeout(
                        std::time::Duration::from_millis(timeout_ms),
                        &mut wait,
                    )
                    .await
                    .ok()
                }
                None => Some(wait.await),
            }
        };

        let Some(status) = waited else {
            // Deadline passed: force-stop and report the timeout.
            let _ = child.start_kill();
            let _ = child.wait().await;
            let timeout_ms = timeout_ms.unwrap_or_default();
            let reader = {
                let mut processes = self.processes.write().await;
                match processes.get_mut(id) {
                    Some(managed) => {
                        managed.info.status = ContainerStatus::Timeout;
                        managed.info.finished_at = Some(Utc::now());
                        managed.reader.take()
                    }
                    None => None,
                }
            };
            Self::join_reader(reader).await;
            return Err(KernelError::Timeout {
                operation: format!("container {id}"),
                timeout_ms,
            });
        };

        let status =
            status.map_err(|e| KernelError::Worker(format!("wait on container {id}: {e}")))?;
        let exit_code = status.code().unwrap_or(-1);

        let (container_status, reader) = {
            let mut processes = self.processes.write().await;
            match processes.get_mut(id) {
                Some(managed) => {
                    if managed.info.status != ContainerStatus::Stopped {
                        managed.info.status = ContainerStatus::Exited;
                    }
                    managed.info.finished_at = Some(Utc::now());
                    (managed.info.status, managed.reader.take())
                }
                None => (ContainerStatus::Exited, None),
            }
        };
        // The pipe closed with the process; the drain finishes promptly and
        // logs are complete once it has.
        Self::join_reader(reader).await;

        Ok(WaitOutcome {
            exit_code,
            status: container_status,
        })
    }

    async fn get_container_logs(&self, id: &str) -> KernelResult<String> {
        let processes = self.processes.read().await;
        let managed = processes
            .get(id)
            .ok_or_else(|| KernelError::Worker(format!("container {id} not found")))?;
        let logs = managed.logs.lock().await;
        Ok(logs.join("\n"))
    }

    async fn cleanup(&self, force: bool) -> KernelResult<()> {
        let mut processes = self.processes.write().await;
        for (id, managed) in processes.iter_mut() {
            managed.kill.notify_waiters();
            if let Some(child) = managed.child.as_mut() {
                if force {
                    if let Err(e) = child.start_kill() {
                        warn!(container = %id, error = %e, "kill failed during cleanup");
                    }
                }
            }
        }
        if force {
            processes.clear();
        }
        Ok(())
    }
}

//! Worker wire protocol.
//!
//! A worker talks newline-delimited JSON on stdout: `log` and `progress`
//! frames while running and exactly one `result` frame at the end. The task
//! reaches the worker either as a JSON `execute` payload on stdin or through
//! `CORTEXOS_*` environment variables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use crate::domain::ports::{ENV_ENVIRONMENT, ENV_INPUTS, ENV_PROMPT, ENV_TASK_ID};

/// Terminal status reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerResultStatus {
    Completed,
    Failed,
}

/// One NDJSON frame on a worker's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerEvent {
    Log {
        level: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Progress {
        stage: String,
        percent: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Result {
        status: WorkerResultStatus,
        output: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
        /// Worker-measured duration in milliseconds.
        duration: u64,
    },
}

/// The stdin payload handed to a worker at launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub prompt: String,
    pub inputs: HashMap<String, String>,
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub environment: String,
}

impl ExecutePayload {
    pub fn new(
        task_id: impl Into<String>,
        prompt: impl Into<String>,
        inputs: HashMap<String, String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            kind: "execute".to_string(),
            prompt: prompt.into(),
            inputs,
            task_id: task_id.into(),
            environment: environment.into(),
        }
    }
}

/// Parse one stdout line into a frame.
///
/// Lines that are not valid frames are folded into `log` events so no
/// worker output is lost; blank lines yield nothing.
pub fn parse_line(line: &str) -> Option<WorkerEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(event) = serde_json::from_str::<WorkerEvent>(trimmed) {
        return Some(event);
    }
    Some(WorkerEvent::Log {
        level: "info".to_string(),
        message: trimmed.to_string(),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_frame() {
        let line = r#"{"type":"result","status":"completed","output":"done","exitCode":0,"duration":42}"#;
        match parse_line(line) {
            Some(WorkerEvent::Result { status, output, exit_code, duration }) => {
                assert_eq!(status, WorkerResultStatus::Completed);
                assert_eq!(output, "done");
                assert_eq!(exit_code, 0);
                assert_eq!(duration, 42);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_log_and_progress_frames() {
        let log = r#"{"type":"log","level":"warn","message":"careful","timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(matches!(parse_line(log), Some(WorkerEvent::Log { .. })));

        let progress = r#"{"type":"progress","stage":"build","percent":50.0}"#;
        match parse_line(progress) {
            Some(WorkerEvent::Progress { stage, percent, message }) => {
                assert_eq!(stage, "build");
                assert!((percent - 50.0).abs() < f64::EPSILON);
                assert!(message.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_plain_text_becomes_log() {
        match parse_line("compiling cortex-kernel v0.1.0") {
            Some(WorkerEvent::Log { level, message, .. }) => {
                assert_eq!(level, "info");
                assert_eq!(message, "compiling cortex-kernel v0.1.0");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(parse_line("   ").is_none());
    }

    #[test]
    fn test_execute_payload_wire_shape() {
        let payload = ExecutePayload::new("task-1", "do it", HashMap::new(), "default");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "execute");
        assert_eq!(json["taskId"], "task-1");
        assert_eq!(json["environment"], "default");
    }
}

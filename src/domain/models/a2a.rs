//! A2A protocol domain models.
//!
//! The public task envelope served by the gateway, the multimodal message
//! shape, and the agent card published at the well-known path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A2A task state, matching the protocol wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum A2aTaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
}

impl A2aTaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether the protocol state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Submitted => matches!(next, Self::Working | Self::Canceled | Self::Failed),
            Self::Working => matches!(
                next,
                Self::Completed | Self::InputRequired | Self::Failed | Self::Canceled
            ),
            Self::InputRequired => matches!(next, Self::Working | Self::Failed | Self::Canceled),
            Self::Completed | Self::Failed | Self::Canceled => false,
        }
    }
}

impl std::fmt::Display for A2aTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message part for multimodal content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Data {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: Value,
    },
    File {
        #[serde(rename = "mimeType")]
        mime_type: String,
        uri: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

/// An A2A protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aMessage {
    /// Sender role (`user` or `agent`).
    pub role: String,
    /// Content parts; at least one is required at task creation.
    pub parts: Vec<MessagePart>,
}

impl A2aMessage {
    /// Build a single-part text message.
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            parts: vec![MessagePart::Text { text: text.into() }],
        }
    }

    /// Concatenated text content of all text parts.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Output artifact attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aArtifact {
    pub id: String,
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub parts: Vec<MessagePart>,
}

/// The public task envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aTask {
    /// Task id (also the SSE channel key).
    pub id: String,
    /// Current protocol state.
    pub status: A2aTaskState,
    /// The message the task was created with.
    pub input: A2aMessage,
    /// Output message, set by the handler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<A2aMessage>,
    /// Message history; `input-required → working` is the only transition
    /// that reads new entries.
    pub history: Vec<A2aMessage>,
    /// Output artifacts, set by the handler.
    pub artifacts: Vec<A2aArtifact>,
    /// Open-schema metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl A2aTask {
    /// Create a freshly submitted task around an input message.
    pub fn new(input: A2aMessage) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: A2aTaskState::Submitted,
            history: vec![input.clone()],
            input,
            output: None,
            artifacts: Vec::new(),
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to `next`, stamping `updated_at`.
    pub fn transition_to(&mut self, next: A2aTaskState) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "invalid transition from {} to {}",
                self.status, next
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Skill advertised on the agent card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Capabilities block of the agent card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub streaming: bool,
    #[serde(rename = "pushNotifications")]
    pub push_notifications: bool,
    #[serde(rename = "stateTransitionHistory")]
    pub state_transition_history: bool,
}

/// The public JSON document served at `/.well-known/agent.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub version: String,
    pub url: String,
    pub capabilities: AgentCapabilities,
    pub skills: Vec<AgentSkill>,
    #[serde(rename = "defaultInputModes")]
    pub default_input_modes: Vec<String>,
    #[serde(rename = "defaultOutputModes")]
    pub default_output_modes: Vec<String>,
}

/// Outbound webhook registration, filtered by task status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRegistration {
    /// HTTPS callback URL.
    pub url: String,
    /// Statuses that trigger a notification; empty means all.
    #[serde(default)]
    pub statuses: Vec<A2aTaskState>,
}

impl PushRegistration {
    /// Whether a transition into `state` should be pushed.
    pub fn matches(&self, state: A2aTaskState) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_happy_path() {
        let mut task = A2aTask::new(A2aMessage::text("user", "hello"));
        assert_eq!(task.status, A2aTaskState::Submitted);

        task.transition_to(A2aTaskState::Working).unwrap();
        task.transition_to(A2aTaskState::InputRequired).unwrap();
        task.transition_to(A2aTaskState::Working).unwrap();
        task.transition_to(A2aTaskState::Completed).unwrap();
        assert!(task.is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut task = A2aTask::new(A2aMessage::text("user", "hello"));
        task.transition_to(A2aTaskState::Working).unwrap();
        task.transition_to(A2aTaskState::Canceled).unwrap();
        assert!(task.transition_to(A2aTaskState::Working).is_err());
    }

    #[test]
    fn test_submitted_cannot_complete_directly() {
        let mut task = A2aTask::new(A2aMessage::text("user", "hello"));
        assert!(task.transition_to(A2aTaskState::Completed).is_err());
    }

    #[test]
    fn test_state_wire_names() {
        let json = serde_json::to_string(&A2aTaskState::InputRequired).unwrap();
        assert_eq!(json, "\"input-required\"");
        let state: A2aTaskState = serde_json::from_str("\"canceled\"").unwrap();
        assert_eq!(state, A2aTaskState::Canceled);
    }

    #[test]
    fn test_message_text_content() {
        let message = A2aMessage {
            role: "user".to_string(),
            parts: vec![
                MessagePart::Text { text: "a".to_string() },
                MessagePart::Data {
                    mime_type: "application/json".to_string(),
                    data: serde_json::json!({"k": 1}),
                },
                MessagePart::Text { text: "b".to_string() },
            ],
        };
        assert_eq!(message.text_content(), "a\nb");
    }

    #[test]
    fn test_push_registration_filter() {
        let all = PushRegistration { url: "https://example.org".to_string(), statuses: vec![] };
        assert!(all.matches(A2aTaskState::Working));

        let only_terminal = PushRegistration {
            url: "https://example.org".to_string(),
            statuses: vec![A2aTaskState::Completed, A2aTaskState::Failed],
        };
        assert!(only_terminal.matches(A2aTaskState::Completed));
        assert!(!only_terminal.matches(A2aTaskState::Working));
    }
}

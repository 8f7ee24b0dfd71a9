use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::requirement::RequirementKind;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Groups runs into one conversation.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message in an agent transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_tool_calls(calls: &[ToolCall]) -> Self {
        Self {
            role: Role::Assistant,
            content: calls
                .iter()
                .map(|c| ContentBlock::ToolUse {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    input: c.arguments.clone(),
                })
                .collect(),
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// A capability invocation requested by the inference collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// Tool definition sent to the inference collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// What a tool invocation produced: a result, or a request for HITL handling.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Result(ToolResult),
    Requirement {
        kind: RequirementKind,
        missing_fields: Vec<String>,
        note: Option<String>,
    },
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub cancel: CancellationToken,
}

/// Request handed to the inference collaborator.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub instructions: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Reply from the inference collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceResponse {
    /// A terminal answer.
    Answer(String),
    /// One or more capability invocations to perform before asking again.
    ToolCalls(Vec<ToolCall>),
}

/// Progress event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        session_id: SessionId,
        target: String,
    },
    RunContinued {
        run_id: RunId,
        resolved: usize,
    },
    StepStarted {
        run_id: RunId,
        path: String,
        name: String,
    },
    StepCompleted {
        run_id: RunId,
        path: String,
        name: String,
        success: bool,
    },
    LoopIteration {
        run_id: RunId,
        path: String,
        iteration: u32,
    },
    MemberStarted {
        run_id: RunId,
        member: String,
        /// Child run id of this member invocation, stable across resumes.
        member_run_id: RunId,
    },
    MemberCompleted {
        run_id: RunId,
        member: String,
        success: bool,
    },
    RequirementRaised {
        run_id: RunId,
        requirement_id: String,
        kind: RequirementKind,
    },
    RequirementResolved {
        run_id: RunId,
        requirement_id: String,
    },
    RunPaused {
        run_id: RunId,
        pending: usize,
    },
    RunCompleted {
        run_id: RunId,
        success: bool,
    },
    RunErrored {
        run_id: RunId,
        error: String,
    },
    RunCancelled {
        run_id: RunId,
    },
    ScheduleFired {
        schedule_id: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    ScheduleRunRecorded {
        schedule_id: String,
        attempt: u32,
        success: bool,
    },
}

impl RunEvent {
    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunContinued { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::LoopIteration { run_id, .. }
            | Self::MemberStarted { run_id, .. }
            | Self::MemberCompleted { run_id, .. }
            | Self::RequirementRaised { run_id, .. }
            | Self::RequirementResolved { run_id, .. }
            | Self::RunPaused { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunErrored { run_id, .. }
            | Self::RunCancelled { run_id } => Some(run_id),
            Self::ScheduleFired { .. } | Self::ScheduleRunRecorded { .. } => None,
        }
    }

    /// Whether this event ends a drive pass (the run paused or reached a terminal state).
    pub fn ends_pass(&self) -> bool {
        matches!(
            self,
            Self::RunPaused { .. }
                | Self::RunCompleted { .. }
                | Self::RunErrored { .. }
                | Self::RunCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_text_skips_tool_blocks() {
        let call = ToolCall::new("search", serde_json::json!({"q": "rust"}));
        let msg = ChatMessage::assistant_tool_calls(&[call]);
        assert_eq!(msg.text(), "");
        assert_eq!(ChatMessage::user("hello").text(), "hello");
    }

    #[test]
    fn run_event_serializes_tagged() {
        let ev = RunEvent::RunPaused {
            run_id: RunId::from_str("r1"),
            pending: 2,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "run_paused");
        assert_eq!(json["pending"], 2);
        assert!(ev.ends_pass());
        assert_eq!(ev.run_id().map(|r| r.0.as_str()), Some("r1"));
    }
}

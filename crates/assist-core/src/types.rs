//! Core types for the assistant run daemon.
//!
//! Wire shapes follow the Assistants API: timestamps are unix seconds,
//! enums are snake_case, and `type` discriminators are plain fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form key/value metadata attached to API objects.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for assistants, threads, messages, runs and steps.
///
/// Generated ids are `<prefix>_<uuidv7>`; UUIDv7 sorts by creation time,
/// so ids of one kind double as pagination cursors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new(prefix: &str) -> Self {
        Self(format!("{prefix}_{}", Uuid::now_v7().simple()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Id prefixes per object kind.
pub mod prefix {
    pub const ASSISTANT: &str = "asst";
    pub const THREAD: &str = "thread";
    pub const MESSAGE: &str = "msg";
    pub const RUN: &str = "run";
    pub const STEP: &str = "step";
    pub const TOOL_CALL: &str = "call";
}

// --- Enumerations ---

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
    Expired,
}

impl RunStatus {
    /// Statuses a cancel request may move to `cancelling`.
    pub const CANCELLABLE: &'static [RunStatus] = &[
        RunStatus::Queued,
        RunStatus::InProgress,
        RunStatus::RequiresAction,
        RunStatus::Cancelling,
    ];

    /// Statuses from which tool outputs are accepted.
    pub const ACCEPTS_TOOL_OUTPUTS: &'static [RunStatus] = &[RunStatus::RequiresAction];

    pub const ALL: &'static [RunStatus] = &[
        RunStatus::Queued,
        RunStatus::InProgress,
        RunStatus::RequiresAction,
        RunStatus::Cancelling,
        RunStatus::Cancelled,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run step status. `in_progress` is the unresolved state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStepStatus {
    InProgress,
    Cancelled,
    Failed,
    Completed,
    Expired,
}

impl RunStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Run step type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    MessageCreation,
    ToolCalls,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageCreation => "message_creation",
            Self::ToolCalls => "tool_calls",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message_creation" => Some(Self::MessageCreation),
            "tool_calls" => Some(Self::ToolCalls),
            _ => None,
        }
    }
}

/// Tool call kind. Anything else deserializes to `Unknown`, which the
/// controller treats as a corrupted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    Function,
    CodeInterpreter,
    Retrieval,
    #[serde(other)]
    Unknown,
}

impl ToolCallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::CodeInterpreter => "code_interpreter",
            Self::Retrieval => "retrieval",
            Self::Unknown => "unknown",
        }
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    #[default]
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// How a run continues after tool outputs are submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Enqueue a fresh job keyed by run id once the run is back in `queued`.
    #[default]
    Enqueue,
    /// Leave dispatch to workers polling for `queued` runs.
    Poll,
}

impl ResumePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Poll => "poll",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enqueue" => Some(Self::Enqueue),
            "poll" => Some(Self::Poll),
            _ => None,
        }
    }
}

// --- Collaborator records ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    pub id: Id,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    pub name: Option<String>,
    pub model: String,
    pub instructions: Option<String>,
    pub tools: Vec<serde_json::Value>,
    pub file_ids: Vec<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Id,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Id,
    pub thread_id: Id,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    pub role: MessageRole,
    pub content: String,
    pub file_ids: Vec<String>,
    pub assistant_id: Option<Id>,
    pub run_id: Option<Id>,
    pub metadata: Metadata,
}

// --- Runs ---

/// Error recorded by the worker when a run fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

/// One execution attempt of an assistant against a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    pub thread_id: Id,
    pub assistant_id: Id,
    pub status: RunStatus,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<RunError>,
    pub model: String,
    pub instructions: Option<String>,
    /// Opaque to the controller.
    pub tools: Vec<serde_json::Value>,
    pub file_ids: Vec<String>,
    pub metadata: Metadata,
}

/// Function call payload of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
    /// Empty until tool outputs are submitted; never overwritten once set.
    pub output: Option<String>,
}

/// One invocation request within a tool-call step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ToolCallKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_interpreter: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<serde_json::Value>,
}

impl ToolCall {
    /// A function tool call with no output yet.
    pub fn function(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: Id::new(prefix::TOOL_CALL).0,
            kind: ToolCallKind::Function,
            function: Some(FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
                output: None,
            }),
            code_interpreter: None,
            retrieval: None,
        }
    }

    /// True for function calls still waiting on an externally supplied output.
    pub fn is_pending_function(&self) -> bool {
        self.kind == ToolCallKind::Function
            && self.function.as_ref().is_some_and(|f| f.output.is_none())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCreation {
    pub message_id: Id,
}

/// Type-specific details of a run step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetails {
    #[serde(rename = "type")]
    pub kind: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_creation: Option<MessageCreation>,
}

impl StepDetails {
    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            kind: StepType::ToolCalls,
            tool_calls: Some(tool_calls),
            message_creation: None,
        }
    }
}

/// A discrete unit of work within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: Id,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    pub run_id: Id,
    pub thread_id: Id,
    pub assistant_id: Id,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub status: RunStepStatus,
    pub step_details: StepDetails,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Externally computed output for one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    #[serde(default)]
    pub output: String,
}

/// `required_action` projection of a run paused on tool outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitToolOutputs {
    pub tool_calls: Vec<ToolCall>,
}

impl RequiredAction {
    /// Built from the open tool step; `None` when nothing is pending.
    pub fn from_step(step: &RunStep) -> Option<Self> {
        if step.status != RunStepStatus::InProgress {
            return None;
        }
        let tool_calls: Vec<ToolCall> = step
            .step_details
            .tool_calls
            .as_deref()?
            .iter()
            .filter(|call| call.is_pending_function())
            .cloned()
            .collect();
        if tool_calls.is_empty() {
            return None;
        }
        Some(Self {
            kind: "submit_tool_outputs".to_string(),
            submit_tool_outputs: SubmitToolOutputs { tool_calls },
        })
    }
}

//! Wire protocol between clients and the gateway.
//!
//! Inbound frames are `{type, requestId?, data}`; outbound frames are
//! `{type, requestId?, timestamp, messageId?, data}`. Both directions use a
//! closed set of tagged variants so dispatch is an exhaustive match, not a
//! string-keyed handler map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BridgeError, ErrorCode};
use agent_stream::PermissionProfile;

// ── Client → Gateway ─────────────────────────────────────────────────────────

/// Messages a client can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// One-shot prompt with a fixed 30s budget.
    #[serde(rename_all = "camelCase")]
    Ask {
        prompt: String,
        working_directory: Option<String>,
        options: Option<PermissionProfile>,
    },

    /// Start (or reuse) a streaming session.
    #[serde(rename_all = "camelCase")]
    StreamStart {
        session_id: Option<String>,
        initial_prompt: String,
        working_directory: String,
        options: Option<PermissionProfile>,
    },

    /// Submit a prompt to an existing session.
    #[serde(rename_all = "camelCase")]
    StreamSend { session_id: String, prompt: String },

    /// Close a stream; `clearChat` also drops the session and its queue.
    #[serde(rename_all = "camelCase")]
    StreamClose {
        session_id: String,
        clear_chat: Option<bool>,
    },

    /// Respond to an outstanding permission request.
    #[serde(rename_all = "camelCase")]
    Permission {
        session_id: String,
        response: String,
    },

    /// Subscribe to event kinds and/or sessions; triggers queued replay.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        events: Option<Vec<String>>,
        session_ids: Option<Vec<String>>,
    },

    /// Acknowledge delivered events by message id.
    #[serde(rename_all = "camelCase")]
    AcknowledgeMessages { message_ids: Vec<String> },

    /// Fetch the buffered message history for a session.
    #[serde(rename_all = "camelCase")]
    GetMessageHistory {
        session_id: String,
        limit: Option<usize>,
        offset: Option<usize>,
    },

    /// Set this client's default working directory (validated).
    #[serde(rename_all = "camelCase")]
    SetWorkingDirectory { working_directory: String },

    /// Meta-commands (`status`, `test`) or a raw agent prompt.
    #[serde(rename_all = "camelCase")]
    ClaudeCommand {
        session_id: Option<String>,
        command: String,
        args: Option<Vec<String>>,
        project_path: Option<String>,
    },

    /// Drop a session's buffers and queued events.
    #[serde(rename_all = "camelCase")]
    ClearChat { session_id: String },

    /// Bind a push-notification device to this client.
    #[serde(rename_all = "camelCase")]
    RegisterDevice {
        device_token: String,
        device_info: Option<Value>,
    },

    /// Liveness probe.
    Ping { timestamp: Option<i64> },
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEnvelope {
    pub request_id: Option<String>,
    pub message: ClientMessage,
}

impl ClientEnvelope {
    /// Parse an inbound frame.
    ///
    /// A missing `data` field is treated as `{}` so bodyless messages such
    /// as `{"type":"ping"}` stay valid.
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            BridgeError::invalid_request(format!("frame is not valid JSON: {e}"))
        })?;

        let request_id = value
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::invalid_request("frame is missing 'type'"))?;
        let data = value
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let message = serde_json::from_value(serde_json::json!({
            "type": message_type,
            "data": data,
        }))
        .map_err(|e| {
            BridgeError::invalid_request(format!("invalid '{message_type}' message: {e}"))
        })?;

        Ok(Self {
            request_id,
            message,
        })
    }
}

// ── Gateway → Client ─────────────────────────────────────────────────────────

/// A single piece of aggregated assistant content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPiece {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ContentPiece {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

/// A fenced code block extracted from assistant text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deliverable {
    pub language: Option<String>,
    pub code: String,
}

/// Error payload carried by `error` events and failed responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&BridgeError> for ErrorBody {
    fn from(error: &BridgeError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            details: error.details(),
        }
    }
}

/// Events the gateway sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Welcome {
        client_id: String,
        server_version: String,
        capabilities: Vec<String>,
        max_sessions: usize,
    },

    #[serde(rename_all = "camelCase")]
    AskResponse {
        success: bool,
        response: Option<Value>,
        error: Option<ErrorBody>,
    },

    #[serde(rename_all = "camelCase")]
    StreamStarted { session_id: String, reused: bool },

    #[serde(rename_all = "camelCase")]
    StreamSent { session_id: String, success: bool },

    #[serde(rename_all = "camelCase")]
    StreamClose { session_id: String, cleared: bool },

    #[serde(rename_all = "camelCase")]
    AssistantMessage {
        session_id: String,
        content: Vec<ContentPiece>,
        deliverables: Vec<Deliverable>,
        message_count: usize,
        #[serde(rename = "final")]
        is_final: bool,
    },

    #[serde(rename_all = "camelCase")]
    ToolUse {
        session_id: String,
        id: Option<String>,
        name: Option<String>,
        input: Value,
    },

    #[serde(rename_all = "camelCase")]
    ToolResult {
        session_id: String,
        tool_use_id: Option<String>,
        content: Value,
        is_error: bool,
    },

    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        session_id: String,
        request_id: String,
        prompt: String,
        options: Vec<String>,
        #[serde(rename = "default")]
        default_option: String,
    },

    #[serde(rename_all = "camelCase")]
    PermissionHandled { session_id: String, accepted: bool },

    #[serde(rename_all = "camelCase")]
    ConversationResult {
        session_id: String,
        success: bool,
        duration_ms: Option<u64>,
        cost_usd: Option<f64>,
        usage: Option<Value>,
    },

    /// Raw passthrough for status records such as the long-running
    /// acknowledgement and periodic progress.
    #[serde(rename_all = "camelCase")]
    StreamChunk { session_id: String, record: Value },

    #[serde(rename_all = "camelCase")]
    SystemInit {
        session_id: String,
        model: Option<String>,
        tools: Vec<String>,
        agent_session_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ProcessHealth { session_id: String, metrics: Value },

    #[serde(rename_all = "camelCase")]
    SessionWarning {
        session_id: String,
        time_remaining_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    SessionExpired { session_id: String },

    #[serde(rename_all = "camelCase")]
    SessionCleaned { session_id: String, reason: String },

    #[serde(rename_all = "camelCase")]
    StreamError {
        session_id: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        dropped: Option<usize>,
    },

    #[serde(rename_all = "camelCase")]
    WorkingDirectorySet { working_directory: String },

    #[serde(rename_all = "camelCase")]
    DeviceRegistered { success: bool },

    #[serde(rename_all = "camelCase")]
    MessageHistory {
        session_id: String,
        messages: Vec<Value>,
        total: usize,
    },

    Error(ErrorBody),

    Pong { timestamp: Option<i64> },
}

impl ServerEvent {
    /// The wire `type` string of this event, used for subscription filters.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Welcome { .. } => "welcome",
            ServerEvent::AskResponse { .. } => "askResponse",
            ServerEvent::StreamStarted { .. } => "streamStarted",
            ServerEvent::StreamSent { .. } => "streamSent",
            ServerEvent::StreamClose { .. } => "streamClose",
            ServerEvent::AssistantMessage { .. } => "assistantMessage",
            ServerEvent::ToolUse { .. } => "toolUse",
            ServerEvent::ToolResult { .. } => "toolResult",
            ServerEvent::PermissionRequest { .. } => "permissionRequest",
            ServerEvent::PermissionHandled { .. } => "permissionHandled",
            ServerEvent::ConversationResult { .. } => "conversationResult",
            ServerEvent::StreamChunk { .. } => "streamChunk",
            ServerEvent::SystemInit { .. } => "systemInit",
            ServerEvent::ProcessHealth { .. } => "processHealth",
            ServerEvent::SessionWarning { .. } => "sessionWarning",
            ServerEvent::SessionExpired { .. } => "sessionExpired",
            ServerEvent::SessionCleaned { .. } => "sessionCleaned",
            ServerEvent::StreamError { .. } => "streamError",
            ServerEvent::WorkingDirectorySet { .. } => "workingDirectorySet",
            ServerEvent::DeviceRegistered { .. } => "deviceRegistered",
            ServerEvent::MessageHistory { .. } => "messageHistory",
            ServerEvent::Error(_) => "error",
            ServerEvent::Pong { .. } => "pong",
        }
    }

    /// The session this event belongs to, for routing and replay.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::StreamStarted { session_id, .. }
            | ServerEvent::StreamSent { session_id, .. }
            | ServerEvent::StreamClose { session_id, .. }
            | ServerEvent::AssistantMessage { session_id, .. }
            | ServerEvent::ToolUse { session_id, .. }
            | ServerEvent::ToolResult { session_id, .. }
            | ServerEvent::PermissionRequest { session_id, .. }
            | ServerEvent::PermissionHandled { session_id, .. }
            | ServerEvent::ConversationResult { session_id, .. }
            | ServerEvent::StreamChunk { session_id, .. }
            | ServerEvent::SystemInit { session_id, .. }
            | ServerEvent::ProcessHealth { session_id, .. }
            | ServerEvent::SessionWarning { session_id, .. }
            | ServerEvent::SessionExpired { session_id }
            | ServerEvent::SessionCleaned { session_id, .. }
            | ServerEvent::StreamError { session_id, .. }
            | ServerEvent::MessageHistory { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Build an `error` event from a handler failure.
    pub fn error(error: &BridgeError) -> Self {
        ServerEvent::Error(ErrorBody::from(error))
    }
}

/// An outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Stable id for acknowledgement and client-side dedup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl ServerEnvelope {
    /// Wrap a session event; gets a fresh message id for ack/dedup.
    pub fn event(event: ServerEvent) -> Self {
        Self {
            request_id: None,
            timestamp: Utc::now(),
            message_id: Some(Uuid::new_v4().to_string()),
            event,
        }
    }

    /// Wrap a direct response to a request.
    pub fn response(request_id: Option<String>, event: ServerEvent) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
            message_id: None,
            event,
        }
    }
}

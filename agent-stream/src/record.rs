//! Record model for the Agent CLI's stream-JSON output.
//!
//! Every line the Agent CLI prints is a JSON object with a `type` field.
//! Classification happens over a raw [`serde_json::Value`] rather than a
//! strict deserialization so that a record with an unexpected shape degrades
//! to [`AgentRecord::Unknown`] instead of failing the whole stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A classified record from the Agent CLI stdout stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentRecord {
    /// `system` record with `subtype: "init"` - the turn's init snapshot.
    SystemInit(SystemInit),
    /// Any other `system` record.
    System { subtype: Option<String>, raw: Value },
    /// An assistant message carrying content blocks.
    Assistant(AssistantMessage),
    /// A `user` record; these carry tool results echoed back to the model
    /// and are never forwarded to clients.
    User { raw: Value },
    /// A standalone tool invocation record.
    ToolUse(ToolUseRecord),
    /// A standalone tool result record.
    ToolResult(ToolResultRecord),
    /// The turn's terminal record.
    Result(TurnResult),
    /// Anything unrecognized; kept for diagnostics, not forwarded.
    Unknown {
        record_type: Option<String>,
        raw: Value,
    },
}

impl AgentRecord {
    /// Classify a parsed JSON value by its `type` field.
    pub fn from_value(value: Value) -> Self {
        let record_type = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);

        match record_type.as_deref() {
            Some("system") => {
                let subtype = value
                    .get("subtype")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if subtype.as_deref() == Some("init") {
                    AgentRecord::SystemInit(SystemInit::from_value(&value))
                } else {
                    AgentRecord::System {
                        subtype,
                        raw: value,
                    }
                }
            }
            Some("assistant") => AgentRecord::Assistant(AssistantMessage::from_value(&value)),
            Some("user") => AgentRecord::User { raw: value },
            Some("tool_use") => AgentRecord::ToolUse(ToolUseRecord::from_value(&value)),
            Some("tool_result") => AgentRecord::ToolResult(ToolResultRecord::from_value(&value)),
            Some("result") => AgentRecord::Result(TurnResult::from_value(&value)),
            _ => AgentRecord::Unknown {
                record_type,
                raw: value,
            },
        }
    }

    /// The wire `type` of this record.
    pub fn record_type(&self) -> &str {
        match self {
            AgentRecord::SystemInit(_) | AgentRecord::System { .. } => "system",
            AgentRecord::Assistant(_) => "assistant",
            AgentRecord::User { .. } => "user",
            AgentRecord::ToolUse(_) => "tool_use",
            AgentRecord::ToolResult(_) => "tool_result",
            AgentRecord::Result(_) => "result",
            AgentRecord::Unknown { .. } => "unknown",
        }
    }
}

/// The `system.init` snapshot emitted at the start of a streamed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInit {
    /// The Agent CLI's own session identifier, used for routing.
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub tools: Vec<String>,
    /// Full record for anything the typed fields do not carry.
    pub raw: Value,
}

impl SystemInit {
    fn from_value(value: &Value) -> Self {
        Self {
            session_id: value
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            model: value
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            tools: value
                .get("tools")
                .and_then(Value::as_array)
                .map(|tools| {
                    tools
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            raw: value.clone(),
        }
    }
}

/// One block inside an assistant message's `content` array.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    Other(Value),
}

impl ContentBlock {
    fn from_value(value: &Value) -> Self {
        match value.get("type").and_then(Value::as_str) {
            Some("text") => ContentBlock::Text {
                text: value
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            Some("tool_use") => ContentBlock::ToolUse {
                id: value
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: value
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: value.get("input").cloned().unwrap_or(Value::Null),
            },
            _ => ContentBlock::Other(value.clone()),
        }
    }

    /// Text content, if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Whether this block is a tool invocation.
    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }
}

/// An assistant message record.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantMessage {
    pub id: Option<String>,
    pub model: Option<String>,
    pub content: Vec<ContentBlock>,
    pub usage: Option<Value>,
    pub raw: Value,
}

impl AssistantMessage {
    fn from_value(value: &Value) -> Self {
        // The CLI nests the actual message under `message`; tolerate a flat
        // shape as well.
        let message = value.get("message").unwrap_or(value);
        let content = match message.get("content") {
            Some(Value::Array(blocks)) => blocks.iter().map(ContentBlock::from_value).collect(),
            // A bare string is a single text block.
            Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
            _ => Vec::new(),
        };

        Self {
            id: message
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string),
            model: message
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            content,
            usage: message.get("usage").cloned(),
            raw: value.clone(),
        }
    }

    /// All text blocks of this message, in order.
    pub fn text_blocks(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(ContentBlock::as_text)
    }

    /// Whether any block is a tool invocation.
    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_use)
    }
}

/// A standalone `tool_use` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseRecord {
    pub id: Option<String>,
    pub name: Option<String>,
    pub input: Value,
    pub raw: Value,
}

impl ToolUseRecord {
    fn from_value(value: &Value) -> Self {
        Self {
            id: value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string),
            name: value
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            input: value.get("input").cloned().unwrap_or(Value::Null),
            raw: value.clone(),
        }
    }
}

/// A standalone `tool_result` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub tool_use_id: Option<String>,
    pub content: Value,
    pub is_error: bool,
    pub raw: Value,
}

impl ToolResultRecord {
    fn from_value(value: &Value) -> Self {
        Self {
            tool_use_id: value
                .get("tool_use_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            content: value.get("content").cloned().unwrap_or(Value::Null),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            raw: value.clone(),
        }
    }
}

/// The terminal `result` record of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    /// Final result text (may be empty; the aggregated assistant text is the
    /// authoritative reply).
    pub result: String,
    pub is_error: bool,
    pub duration_ms: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<Value>,
    /// The Agent CLI's session identifier, used for routing.
    pub session_id: Option<String>,
    pub raw: Value,
}

impl TurnResult {
    fn from_value(value: &Value) -> Self {
        Self {
            result: value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            duration_ms: value.get("duration_ms").and_then(Value::as_u64),
            total_cost_usd: value
                .get("total_cost_usd")
                .or_else(|| value.get("cost_usd"))
                .and_then(Value::as_f64),
            usage: value.get("usage").cloned(),
            session_id: value
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            raw: value.clone(),
        }
    }
}

//! Per-session turn accumulator.
//!
//! The buffer collects everything a streamed turn produces before
//! finalization: assistant message fragments, tool records, extracted code
//! deliverables, the init snapshot, and - during a permission cycle - the
//! stashed final payload awaiting the client's answer.

use std::collections::HashSet;

use serde_json::Value;

use crate::protocol::{Deliverable, ServerEvent};
use agent_stream::SystemInit;

/// One buffered assistant message fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessage {
    pub id: Option<String>,
    pub model: Option<String>,
    pub text_blocks: Vec<String>,
    pub usage: Option<Value>,
}

/// The aggregated final payload stashed while a permission request is
/// outstanding.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFinal {
    /// Events to emit on approval, in order (`assistantMessage{final}` then
    /// `conversationResult`).
    pub events: Vec<ServerEvent>,
}

/// Per-session accumulator for the current turn.
#[derive(Debug, Default)]
pub struct SessionBuffer {
    pub assistant_messages: Vec<BufferedMessage>,
    /// Raw tool_use records observed this turn.
    pub tool_uses: Vec<Value>,
    pub deliverables: Vec<Deliverable>,
    pub pending_final: Option<PendingFinal>,
    pub permission_request_sent: bool,
    pub tool_use_in_progress: bool,
    pub system_init: Option<SystemInit>,
}

impl SessionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of assistant messages buffered this turn.
    pub fn message_count(&self) -> usize {
        self.assistant_messages.len()
    }

    /// Concatenate unique, non-empty text blocks from all buffered messages
    /// with blank-line separators.
    pub fn aggregate_text(&self) -> String {
        let mut seen = HashSet::new();
        let mut parts = Vec::new();
        for message in &self.assistant_messages {
            for block in &message.text_blocks {
                let trimmed = block.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if seen.insert(trimmed.to_string()) {
                    parts.push(trimmed.to_string());
                }
            }
        }
        parts.join("\n\n")
    }

    /// Reset the buffer after final delivery. The init snapshot is kept so
    /// later turns can still answer status queries about the conversation.
    pub fn clear(&mut self, retain_init: bool) {
        let init = if retain_init {
            self.system_init.take()
        } else {
            None
        };
        *self = Self::default();
        self.system_init = init;
    }
}

/// Extract fenced code blocks (```` ```lang\n...``` ````) from assistant
/// text.
pub fn extract_code_blocks(text: &str) -> Vec<Deliverable> {
    let mut deliverables = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(newline) = after_open.find('\n') else {
            break;
        };
        let language = after_open[..newline].trim();
        let body = &after_open[newline + 1..];
        let Some(close) = body.find("```") else {
            break;
        };

        let code = body[..close].trim_end_matches('\n');
        if !code.trim().is_empty() {
            deliverables.push(Deliverable {
                language: if language.is_empty() {
                    None
                } else {
                    Some(language.to_string())
                },
                code: code.to_string(),
            });
        }
        rest = &body[close + 3..];
    }

    deliverables
}

//! Record aggregation and turn finalization.
//!
//! The aggregator reclassifies the Agent CLI's raw records into the
//! canonical outbound event set: assistant fragments are buffered and merged
//! into one final message per turn, tool records are forwarded with
//! timestamps, permission-shaped text opens a permission cycle, and the
//! terminal `result` record either emits the final pair
//! (`assistantMessage{final}` then `conversationResult`) or stashes it until
//! the client answers an outstanding permission request.

use tracing::debug;

use crate::permission::{self, PermissionRequest, DENIAL_TEXT};
use crate::protocol::{ContentPiece, ServerEvent};
use crate::session::buffer::{extract_code_blocks, BufferedMessage, PendingFinal, SessionBuffer};
use agent_stream::{AgentRecord, TurnResult};

/// Result of finalizing a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnFinalization {
    /// Events to deliver now, in order.
    pub events: Vec<ServerEvent>,
    /// True when the final payload was stashed pending a permission answer.
    pub deferred: bool,
}

/// Outcome of a client's permission response.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionResolution {
    /// No permission cycle was outstanding.
    NonePending,
    /// Approved; the stashed final events follow.
    Approved { events: Vec<ServerEvent> },
    /// Denied; a canned denial final and a failed result follow.
    Denied { events: Vec<ServerEvent> },
}

/// Ingest one non-terminal record into the session buffer, returning any
/// events to deliver immediately.
pub fn ingest(buffer: &mut SessionBuffer, session_id: &str, record: &AgentRecord) -> Vec<ServerEvent> {
    match record {
        AgentRecord::SystemInit(init) => {
            // Stored for status queries and routing; never forwarded.
            buffer.system_init = Some(init.clone());
            Vec::new()
        }
        AgentRecord::System { subtype, .. } => {
            debug!(?subtype, "ignoring non-init system record");
            Vec::new()
        }
        AgentRecord::Assistant(message) => {
            if buffer.permission_request_sent {
                // Coalesced: one outstanding request per session, and no
                // further buffering until it resolves.
                debug!(session = %session_id, "assistant text during permission wait dropped");
                return Vec::new();
            }

            let mut events = Vec::new();
            let text_blocks: Vec<String> =
                message.text_blocks().map(str::to_string).collect();
            let full_text = text_blocks.join("\n");

            if permission::detect(&full_text) {
                buffer.permission_request_sent = true;
                let request = PermissionRequest::from_text(session_id, &full_text);
                events.push(permission_event(&request));
            }

            for block in &text_blocks {
                buffer.deliverables.extend(extract_code_blocks(block));
            }
            if message.has_tool_use() {
                buffer.tool_use_in_progress = true;
            }
            buffer.assistant_messages.push(BufferedMessage {
                id: message.id.clone(),
                model: message.model.clone(),
                text_blocks,
                usage: message.usage.clone(),
            });
            events
        }
        // Tool results echoed through `user` records never reach clients.
        AgentRecord::User { .. } => Vec::new(),
        AgentRecord::ToolUse(tool_use) => {
            buffer.tool_uses.push(tool_use.raw.clone());
            vec![ServerEvent::ToolUse {
                session_id: session_id.to_string(),
                id: tool_use.id.clone(),
                name: tool_use.name.clone(),
                input: tool_use.input.clone(),
            }]
        }
        AgentRecord::ToolResult(tool_result) => vec![ServerEvent::ToolResult {
            session_id: session_id.to_string(),
            tool_use_id: tool_result.tool_use_id.clone(),
            content: tool_result.content.clone(),
            is_error: tool_result.is_error,
        }],
        AgentRecord::Result(_) => {
            debug!("terminal record routed through finalize, not ingest");
            Vec::new()
        }
        AgentRecord::Unknown { record_type, .. } => {
            debug!(?record_type, "dropping unrecognized record");
            Vec::new()
        }
    }
}

/// Finalize a turn at its `result` record.
pub fn finalize(
    buffer: &mut SessionBuffer,
    session_id: &str,
    result: &TurnResult,
) -> TurnFinalization {
    // An open permission cycle defers delivery; the request event already
    // went out when the cycle opened.
    if buffer.permission_request_sent {
        let events = build_final_events(buffer, session_id, result);
        buffer.pending_final = Some(PendingFinal { events });
        return TurnFinalization {
            events: Vec::new(),
            deferred: true,
        };
    }

    // The result text itself may be the permission question.
    if permission::detect(&result.result) {
        buffer.permission_request_sent = true;
        let request = PermissionRequest::from_text(session_id, &result.result);
        let events = build_final_events(buffer, session_id, result);
        buffer.pending_final = Some(PendingFinal { events });
        return TurnFinalization {
            events: vec![permission_event(&request)],
            deferred: true,
        };
    }

    let events = build_final_events(buffer, session_id, result);
    buffer.clear(true);
    TurnFinalization {
        events,
        deferred: false,
    }
}

/// Resolve an outstanding permission cycle with the client's reply.
pub fn resolve_permission(
    buffer: &mut SessionBuffer,
    session_id: &str,
    response: &str,
) -> PermissionResolution {
    if !buffer.permission_request_sent && buffer.pending_final.is_none() {
        return PermissionResolution::NonePending;
    }

    if permission::is_approval(response) {
        let events = buffer
            .pending_final
            .take()
            .map(|pending| pending.events)
            .unwrap_or_default();
        buffer.clear(true);
        PermissionResolution::Approved { events }
    } else {
        let message_count = buffer.message_count();
        buffer.clear(true);
        PermissionResolution::Denied {
            events: vec![
                ServerEvent::AssistantMessage {
                    session_id: session_id.to_string(),
                    content: vec![ContentPiece::text(DENIAL_TEXT)],
                    deliverables: Vec::new(),
                    message_count,
                    is_final: true,
                },
                ServerEvent::ConversationResult {
                    session_id: session_id.to_string(),
                    success: false,
                    duration_ms: None,
                    cost_usd: None,
                    usage: None,
                },
            ],
        }
    }
}

/// Discard a stashed final payload because the client moved on with a new
/// prompt instead of answering (implicit denial).
pub fn discard_pending(buffer: &mut SessionBuffer) -> bool {
    let had_pending = buffer.pending_final.is_some() || buffer.permission_request_sent;
    if had_pending {
        buffer.clear(true);
    }
    had_pending
}

fn permission_event(request: &PermissionRequest) -> ServerEvent {
    ServerEvent::PermissionRequest {
        session_id: request.session_id.clone(),
        request_id: request.request_id.clone(),
        prompt: request.prompt.clone(),
        options: request.options.clone(),
        default_option: request.default_option.clone(),
    }
}

/// Build the `assistantMessage{final}` + `conversationResult` pair.
///
/// The result text is never echoed into the `conversationResult`; clients
/// would otherwise render the reply twice.
fn build_final_events(
    buffer: &SessionBuffer,
    session_id: &str,
    result: &TurnResult,
) -> Vec<ServerEvent> {
    let aggregated = buffer.aggregate_text();
    let text = if aggregated.is_empty() {
        result.result.clone()
    } else {
        aggregated
    };
    let content = if text.is_empty() {
        Vec::new()
    } else {
        vec![ContentPiece::text(text)]
    };

    vec![
        ServerEvent::AssistantMessage {
            session_id: session_id.to_string(),
            content,
            deliverables: buffer.deliverables.clone(),
            message_count: buffer.message_count(),
            is_final: true,
        },
        ServerEvent::ConversationResult {
            session_id: session_id.to_string(),
            success: !result.is_error,
            duration_ms: result.duration_ms,
            cost_usd: result.total_cost_usd,
            usage: result.usage.clone(),
        },
    ]
}

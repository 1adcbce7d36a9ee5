//! Orchestration: wiring, dispatch, and delivery.
//!
//! The [`Bridge`] owns the session manager, the delivery queue, and the
//! client registry, and routes every inbound message type to its handler.
//! Handler failures never cross the dispatch boundary: they are translated
//! into `error` envelopes for the requesting client.

mod turn;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::aggregate::{self, PermissionResolution};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::gateway::connection::{ClientHandle, ClientRegistry};
use crate::paths::validate_working_directory;
use crate::protocol::{ClientEnvelope, ClientMessage, ServerEnvelope, ServerEvent};
use crate::queue::DeliveryQueue;
use crate::session::{Session, SessionLifecycleEvent, SessionManager};
use agent_stream::{
    locate_agent_cli, AgentRecord, PermissionProfile, SpawnSpec, Supervisor, TimeoutProfile,
};

/// Interval between session timeout sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Interval between delivery-queue expiry passes.
const EXPIRY_INTERVAL: Duration = Duration::from_secs(600);

/// Central coordinator owning all shared state.
pub struct Bridge {
    pub config: BridgeConfig,
    pub sessions: SessionManager,
    pub queue: DeliveryQueue,
    pub clients: ClientRegistry,
    agent_program: Mutex<Option<PathBuf>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let sessions = SessionManager::new(
            config.max_sessions,
            config.session_timeout(),
            config.session_warning(),
        );
        let queue = DeliveryQueue::new(config.queue_capacity, config.queue_ttl());
        Arc::new(Self {
            config,
            sessions,
            queue,
            clients: ClientRegistry::new(),
            agent_program: Mutex::new(None),
        })
    }

    /// Resolve (and cache) the Agent CLI binary.
    pub async fn agent_program(&self) -> Result<PathBuf> {
        if let Some(path) = self
            .agent_program
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Ok(path);
        }
        let path = match &self.config.agent_cli_path {
            Some(path) => path.clone(),
            None => locate_agent_cli(&self.config.agent_command)
                .await
                .map_err(|e| BridgeError::CommandFailed {
                    message: e.to_string(),
                })?,
        };
        *self.agent_program.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.clone());
        Ok(path)
    }

    /// The `welcome` event sent on accept.
    pub fn welcome(&self, client_id: &str) -> ServerEvent {
        ServerEvent::Welcome {
            client_id: client_id.to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec![
                "streaming".to_string(),
                "permissions".to_string(),
                "queuedDelivery".to_string(),
                "messageHistory".to_string(),
                "workspace".to_string(),
            ],
            max_sessions: self.config.max_sessions,
        }
    }

    /// Deliver a session event: straight to live subscribers, or into the
    /// queue when none are reachable. Delivered or not, the event lands in
    /// the session's history.
    pub fn deliver(&self, event: ServerEvent) {
        let Some(session_id) = event.session_id().map(str::to_string) else {
            debug!(kind = event.kind(), "event without session dropped from delivery");
            return;
        };

        let envelope = ServerEnvelope::event(event);
        if let Some(session) = self.sessions.get_session(&session_id) {
            if let Ok(value) = serde_json::to_value(&envelope) {
                session.push_history(value);
            }
        }

        let subscribers = self
            .clients
            .subscribers_for(&session_id, envelope.event.kind());
        if subscribers.is_empty() {
            self.queue.store(&session_id, envelope);
            return;
        }

        let mut reached = false;
        for client in &subscribers {
            if client.send(envelope.clone()) {
                reached = true;
            }
        }
        if !reached {
            // Every live subscriber raced away; keep the event.
            self.queue.store(&session_id, envelope);
        }
    }

    /// Handle one inbound frame. Never returns an error: failures become
    /// `error` envelopes for this client.
    pub async fn handle_frame(self: &Arc<Self>, client: &Arc<ClientHandle>, text: &str) {
        client.touch();

        let (request_id, message) = match ClientEnvelope::parse(text) {
            Ok(envelope) => (envelope.request_id, envelope.message),
            Err(error) => {
                client.send(ServerEnvelope::response(None, ServerEvent::error(&error)));
                return;
            }
        };

        if let Err(error) = self.dispatch(client, request_id.clone(), message).await {
            warn!(client = %client.id, code = %error.code(), "handler failed: {error}");
            client.send(ServerEnvelope::response(
                request_id,
                ServerEvent::error(&error),
            ));
        }
    }

    /// Exhaustive dispatch over the inbound message set.
    async fn dispatch(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        request_id: Option<String>,
        message: ClientMessage,
    ) -> Result<()> {
        match message {
            ClientMessage::Ask {
                prompt,
                working_directory,
                options,
            } => {
                self.handle_ask(client, request_id, prompt, working_directory, options)
                    .await
            }
            ClientMessage::StreamStart {
                session_id,
                initial_prompt,
                working_directory,
                options,
            } => self.handle_stream_start(
                client,
                request_id,
                session_id,
                initial_prompt,
                working_directory,
                options,
            ),
            ClientMessage::StreamSend { session_id, prompt } => {
                self.handle_stream_send(client, request_id, session_id, prompt)
            }
            ClientMessage::StreamClose {
                session_id,
                clear_chat,
            } => self.handle_stream_close(client, request_id, session_id, clear_chat),
            ClientMessage::Permission {
                session_id,
                response,
            } => self.handle_permission(client, request_id, session_id, response),
            ClientMessage::Subscribe {
                events,
                session_ids,
            } => self.handle_subscribe(client, events, session_ids),
            ClientMessage::AcknowledgeMessages { message_ids } => {
                self.queue.acknowledge(&message_ids, &client.id);
                Ok(())
            }
            ClientMessage::GetMessageHistory {
                session_id,
                limit,
                offset,
            } => self.handle_message_history(client, request_id, session_id, limit, offset),
            ClientMessage::SetWorkingDirectory { working_directory } => {
                self.handle_set_working_directory(client, request_id, working_directory)
            }
            ClientMessage::ClaudeCommand {
                session_id,
                command,
                args,
                project_path,
            } => {
                self.handle_agent_command(
                    client,
                    request_id,
                    session_id,
                    command,
                    args,
                    project_path,
                )
                .await
            }
            ClientMessage::ClearChat { session_id } => {
                self.handle_clear_chat(client, request_id, session_id)
            }
            ClientMessage::RegisterDevice {
                device_token,
                device_info,
            } => {
                client.bind_device(device_token, device_info);
                client.send(ServerEnvelope::response(
                    request_id,
                    ServerEvent::DeviceRegistered { success: true },
                ));
                Ok(())
            }
            ClientMessage::Ping { timestamp } => {
                client.send(ServerEnvelope::response(
                    request_id,
                    ServerEvent::Pong { timestamp },
                ));
                Ok(())
            }
        }
    }

    // ── Handlers ─────────────────────────────────────────────────────────────

    async fn handle_ask(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        request_id: Option<String>,
        prompt: String,
        working_directory: Option<String>,
        options: Option<PermissionProfile>,
    ) -> Result<()> {
        let working_dir = match working_directory {
            Some(raw) => validate_working_directory(&raw, &self.config.safe_root)?,
            None => client
                .working_directory()
                .unwrap_or_else(|| self.config.safe_root.clone()),
        };

        let profile = options.unwrap_or_else(PermissionProfile::one_shot);
        let args = profile.build_args(false)?;
        let program = self.agent_program().await?;

        let outcome = Supervisor::new(SpawnSpec {
            program,
            args,
            working_dir,
            prompt: Some(prompt),
            timeout: TimeoutProfile::one_shot(),
        })
        .run()
        .await;

        let event = match outcome {
            Ok(output) => {
                let result = output.records.iter().rev().find_map(|value| {
                    match AgentRecord::from_value(value.clone()) {
                        AgentRecord::Result(result) => Some(result),
                        _ => None,
                    }
                });
                match result {
                    Some(result) => ServerEvent::AskResponse {
                        success: !result.is_error,
                        response: Some(result.raw),
                        error: None,
                    },
                    None => ServerEvent::AskResponse {
                        success: false,
                        response: None,
                        error: Some((&BridgeError::EmptyOutput).into()),
                    },
                }
            }
            Err(error) => {
                let error: BridgeError = error.into();
                ServerEvent::AskResponse {
                    success: false,
                    response: None,
                    error: Some((&error).into()),
                }
            }
        };

        client.send(ServerEnvelope::response(request_id, event));
        Ok(())
    }

    fn handle_stream_start(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        request_id: Option<String>,
        session_id: Option<String>,
        initial_prompt: String,
        working_directory: String,
        options: Option<PermissionProfile>,
    ) -> Result<()> {
        let resolved = validate_working_directory(&working_directory, &self.config.safe_root)?;
        let profile = options.unwrap_or_default();
        // Surface argv problems to the requester instead of failing the
        // first turn.
        profile.build_args(true)?;
        let (session, reused) =
            self.sessions
                .create_session(session_id.as_deref(), resolved, &working_directory, profile)?;

        client.associate_session(&session.id);
        session.mark_conversation_started();
        client.send(ServerEnvelope::response(
            request_id.clone(),
            ServerEvent::StreamStarted {
                session_id: session.id.clone(),
                reused,
            },
        ));

        tokio::spawn(turn::run_streaming_turn(
            self.clone(),
            session,
            initial_prompt,
            client.clone(),
            request_id,
        ));
        Ok(())
    }

    fn handle_stream_send(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        request_id: Option<String>,
        session_id: String,
        prompt: String,
    ) -> Result<()> {
        let session = self.lookup_session(&session_id)?;
        client.associate_session(&session.id);

        // A new prompt during a permission wait is an implicit denial: the
        // stashed final is discarded and the prompt becomes a fresh turn.
        let discarded = session.with_buffer(aggregate::discard_pending);
        if discarded {
            info!(session = %session.id, "pending permission discarded by new prompt");
        }

        session.touch();
        client.send(ServerEnvelope::response(
            request_id.clone(),
            ServerEvent::StreamSent {
                session_id: session.id.clone(),
                success: true,
            },
        ));

        tokio::spawn(turn::run_streaming_turn(
            self.clone(),
            session,
            prompt,
            client.clone(),
            request_id,
        ));
        Ok(())
    }

    fn handle_stream_close(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        request_id: Option<String>,
        session_id: String,
        clear_chat: Option<bool>,
    ) -> Result<()> {
        let cleared = clear_chat.unwrap_or(false);
        if cleared {
            self.sessions.kill_session(&session_id, "streamClose");
            self.queue.clear(&session_id);
        } else {
            // Pause the association only; the session keeps running.
            client.dissociate_session(&session_id);
        }
        client.send(ServerEnvelope::response(
            request_id,
            ServerEvent::StreamClose {
                session_id,
                cleared,
            },
        ));
        Ok(())
    }

    fn handle_permission(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        request_id: Option<String>,
        session_id: String,
        response: String,
    ) -> Result<()> {
        let session = self.lookup_session(&session_id)?;
        session.touch();

        let resolution = session
            .with_buffer(|buffer| aggregate::resolve_permission(buffer, &session.id, &response));

        let (accepted, events) = match resolution {
            PermissionResolution::NonePending => {
                return Err(BridgeError::session(
                    session.id.clone(),
                    "no permission request is outstanding",
                ));
            }
            PermissionResolution::Approved { events } => (true, events),
            PermissionResolution::Denied { events } => (false, events),
        };

        client.send(ServerEnvelope::response(
            request_id,
            ServerEvent::PermissionHandled {
                session_id: session.id.clone(),
                accepted,
            },
        ));
        for event in events {
            self.deliver(event);
        }
        Ok(())
    }

    fn handle_subscribe(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        events: Option<Vec<String>>,
        session_ids: Option<Vec<String>>,
    ) -> Result<()> {
        let sessions = session_ids.clone().unwrap_or_default();
        client.subscribe(events, session_ids);

        // Replay everything queued for the declared sessions, in order,
        // before any new events can race in.
        for session_id in sessions {
            let delivered = self
                .queue
                .deliver_queued(&session_id, &client.id, |envelope| {
                    client.send(envelope.clone())
                });
            if delivered > 0 {
                debug!(client = %client.id, session = %session_id, delivered, "replay complete");
            }
        }
        Ok(())
    }

    fn handle_message_history(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        request_id: Option<String>,
        session_id: String,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<()> {
        let session = self.lookup_session(&session_id)?;
        let (messages, total) = session.history_slice(limit, offset);
        client.send(ServerEnvelope::response(
            request_id,
            ServerEvent::MessageHistory {
                session_id,
                messages,
                total,
            },
        ));
        Ok(())
    }

    fn handle_set_working_directory(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        request_id: Option<String>,
        working_directory: String,
    ) -> Result<()> {
        let resolved = validate_working_directory(&working_directory, &self.config.safe_root)?;
        client.set_working_directory(resolved.clone());
        client.send(ServerEnvelope::response(
            request_id,
            ServerEvent::WorkingDirectorySet {
                working_directory: resolved.display().to_string(),
            },
        ));
        Ok(())
    }

    async fn handle_agent_command(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        request_id: Option<String>,
        session_id: Option<String>,
        command: String,
        args: Option<Vec<String>>,
        project_path: Option<String>,
    ) -> Result<()> {
        match command.as_str() {
            // Meta-commands answered locally, without touching the agent.
            "status" => {
                let status = self.status_payload(session_id.as_deref());
                client.send(ServerEnvelope::response(
                    request_id,
                    ServerEvent::AskResponse {
                        success: true,
                        response: Some(status),
                        error: None,
                    },
                ));
                Ok(())
            }
            "test" => {
                let program = self.agent_program().await?;
                let version = agent_stream::health_check(&program).await.map_err(|e| {
                    BridgeError::CommandFailed {
                        message: e.to_string(),
                    }
                })?;
                client.send(ServerEnvelope::response(
                    request_id,
                    ServerEvent::AskResponse {
                        success: true,
                        response: Some(json!({ "version": version })),
                        error: None,
                    },
                ));
                Ok(())
            }
            // Anything else is a prompt for the agent.
            _ => {
                let mut prompt = command;
                if let Some(args) = args {
                    if !args.is_empty() {
                        prompt = format!("{prompt} {}", args.join(" "));
                    }
                }

                let session = match session_id {
                    Some(id) => self.lookup_session(&id)?,
                    None => {
                        let raw = project_path.ok_or_else(|| {
                            BridgeError::invalid_request(
                                "claudeCommand needs a sessionId or projectPath",
                            )
                        })?;
                        let resolved =
                            validate_working_directory(&raw, &self.config.safe_root)?;
                        let (session, _) = self.sessions.create_session(
                            None,
                            resolved,
                            &raw,
                            PermissionProfile::default(),
                        )?;
                        session
                    }
                };

                client.associate_session(&session.id);
                client.send(ServerEnvelope::response(
                    request_id.clone(),
                    ServerEvent::StreamSent {
                        session_id: session.id.clone(),
                        success: true,
                    },
                ));
                tokio::spawn(turn::run_streaming_turn(
                    self.clone(),
                    session,
                    prompt,
                    client.clone(),
                    request_id,
                ));
                Ok(())
            }
        }
    }

    fn handle_clear_chat(
        self: &Arc<Self>,
        client: &Arc<ClientHandle>,
        request_id: Option<String>,
        session_id: String,
    ) -> Result<()> {
        let session = self.lookup_session(&session_id)?;
        session.with_buffer(|buffer| buffer.clear(false));
        self.queue.clear(&session.id);
        self.sessions.kill_session(&session.id, "clearChat");
        client.send(ServerEnvelope::response(
            request_id,
            ServerEvent::StreamClose {
                session_id,
                cleared: true,
            },
        ));
        Ok(())
    }

    // ── Support ──────────────────────────────────────────────────────────────

    /// Find a session by internal id, falling back to the Agent CLI's own
    /// session id via the routing map.
    fn lookup_session(&self, session_id: &str) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.get_session(session_id) {
            return Ok(session);
        }
        if let Some(internal) = self.sessions.resolve_external(session_id) {
            if let Some(session) = self.sessions.get_session(&internal) {
                return Ok(session);
            }
        }
        Err(BridgeError::session_not_found(session_id))
    }

    fn status_payload(&self, session_id: Option<&str>) -> serde_json::Value {
        let session = session_id.and_then(|id| self.sessions.get_session(id));
        match session {
            Some(session) => {
                let init = session.with_buffer(|buffer| {
                    buffer
                        .system_init
                        .as_ref()
                        .map(|init| (init.model.clone(), init.tools.clone()))
                });
                json!({
                    "sessionId": session.id,
                    "workingDirectory": session.working_directory.display().to_string(),
                    "processing": session.is_processing(),
                    "conversationStarted": session.conversation_started(),
                    "agentSessionId": session.external_agent_session_id(),
                    "model": init.as_ref().and_then(|(model, _)| model.clone()),
                    "tools": init.map(|(_, tools)| tools).unwrap_or_default(),
                    "queuedEvents": self.queue.pending_count(&session.id),
                })
            }
            None => json!({
                "sessions": self.sessions.session_count(),
                "maxSessions": self.config.max_sessions,
                "clients": self.clients.len(),
                "serverVersion": env!("CARGO_PKG_VERSION"),
            }),
        }
    }

    /// Spawn the background maintenance tasks. A no-op in test mode.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        if self.config.test_mode {
            info!("test mode: background timers disabled");
            return;
        }

        // Lifecycle events (from sweeps and explicit closes) fan out to
        // subscribed clients through the normal delivery path.
        let lifecycle_bridge = self.clone();
        let mut lifecycle = self.sessions.subscribe();
        tokio::spawn(async move {
            loop {
                match lifecycle.recv().await {
                    Ok(event) => lifecycle_bridge.deliver_lifecycle(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "lifecycle listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let sweep_bridge = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let queue = &sweep_bridge.queue;
                sweep_bridge.sessions.sweep(|id| queue.has_pending(id));
            }
        });

        let expiry_bridge = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXPIRY_INTERVAL);
            loop {
                ticker.tick().await;
                expiry_bridge.queue.expire();
            }
        });
    }

    /// Graceful shutdown: cancel every in-flight turn and close all
    /// sessions. Queued events stay in memory only, so nothing outlives the
    /// process.
    pub fn shutdown(&self) {
        info!("shutting down: cancelling in-flight turns");
        for session in self.sessions.list_sessions() {
            session.cancel_turn();
            self.sessions.close_session(&session.id, "shutdown");
        }
    }

    fn deliver_lifecycle(&self, event: SessionLifecycleEvent) {
        let server_event = match event {
            SessionLifecycleEvent::Warning {
                session_id,
                time_remaining,
            } => ServerEvent::SessionWarning {
                session_id,
                time_remaining_ms: time_remaining.as_millis() as u64,
            },
            SessionLifecycleEvent::Expired { session_id } => {
                ServerEvent::SessionExpired { session_id }
            }
            SessionLifecycleEvent::Cleaned { session_id, reason } => {
                ServerEvent::SessionCleaned { session_id, reason }
            }
        };
        self.deliver(server_event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn bridge() -> Arc<Bridge> {
        let config = BridgeConfig {
            safe_root: std::env::temp_dir(),
            test_mode: true,
            ..Default::default()
        };
        Bridge::new(config)
    }

    fn client(bridge: &Arc<Bridge>) -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ClientHandle::new("c1".to_string(), tx));
        bridge.clients.register(handle.clone());
        (handle, rx)
    }

    #[test]
    fn welcome_advertises_capabilities_and_limits() {
        let bridge = bridge();
        match bridge.welcome("c1") {
            ServerEvent::Welcome {
                client_id,
                capabilities,
                max_sessions,
                ..
            } => {
                assert_eq!(client_id, "c1");
                assert_eq!(max_sessions, 10);
                assert!(capabilities.contains(&"permissions".to_string()));
            }
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    #[test]
    fn events_without_subscribers_are_queued() {
        let bridge = bridge();
        let (session, _) = bridge
            .sessions
            .create_session(None, std::env::temp_dir(), "/any", Default::default())
            .unwrap();

        bridge.deliver(ServerEvent::SessionExpired {
            session_id: session.id.clone(),
        });
        assert_eq!(bridge.queue.pending_count(&session.id), 1);
    }

    #[test]
    fn events_reach_subscribed_clients_directly() {
        let bridge = bridge();
        let (handle, mut rx) = client(&bridge);
        let (session, _) = bridge
            .sessions
            .create_session(None, std::env::temp_dir(), "/any", Default::default())
            .unwrap();
        handle.associate_session(&session.id);

        bridge.deliver(ServerEvent::SessionExpired {
            session_id: session.id.clone(),
        });
        assert!(rx.try_recv().is_ok());
        assert!(!bridge.queue.has_pending(&session.id));
    }

    #[test]
    fn lookup_falls_back_to_the_external_routing_map() {
        let bridge = bridge();
        let (session, _) = bridge
            .sessions
            .create_session(None, std::env::temp_dir(), "/any", Default::default())
            .unwrap();
        bridge
            .sessions
            .track_for_routing("ext-42", "/any", Some(&session.id))
            .unwrap();

        let found = bridge.lookup_session("ext-42").unwrap();
        assert_eq!(found.id, session.id);
        assert!(bridge.lookup_session("missing").is_err());
    }

    #[test]
    fn shutdown_closes_every_session() {
        let bridge = bridge();
        bridge
            .sessions
            .create_session(None, std::env::temp_dir(), "/a", Default::default())
            .unwrap();
        bridge
            .sessions
            .create_session(None, std::env::temp_dir(), "/b", Default::default())
            .unwrap();

        bridge.shutdown();
        assert_eq!(bridge.sessions.session_count(), 0);
    }
}

//! Per-client connection state and the client registry.
//!
//! The gateway owns every client record. Sessions refer to clients by id
//! only, so client teardown is local: remove the handle and the outbound
//! channel closes, while sessions keep running in the background.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::ServerEnvelope;

/// A push-notification device bound to a client.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    pub token: String,
    pub info: Option<Value>,
}

#[derive(Debug)]
struct ClientState {
    /// Subscribed event kinds; empty means "everything".
    subscriptions: HashSet<String>,
    /// Sessions this client is associated with.
    sessions: HashSet<String>,
    last_activity: DateTime<Utc>,
    alive: bool,
    working_directory: Option<PathBuf>,
    device: Option<DeviceBinding>,
}

/// One connected client.
pub struct ClientHandle {
    pub id: String,
    outbound: mpsc::UnboundedSender<ServerEnvelope>,
    state: RwLock<ClientState>,
}

impl ClientHandle {
    pub fn new(id: String, outbound: mpsc::UnboundedSender<ServerEnvelope>) -> Self {
        Self {
            id,
            outbound,
            state: RwLock::new(ClientState {
                subscriptions: HashSet::new(),
                sessions: HashSet::new(),
                last_activity: Utc::now(),
                alive: true,
                working_directory: None,
                device: None,
            }),
        }
    }

    /// Queue a frame on this client's outbound channel.
    pub fn send(&self, envelope: ServerEnvelope) -> bool {
        self.outbound.send(envelope).is_ok()
    }

    pub fn touch(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.last_activity = Utc::now();
        state.alive = true;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_activity
    }

    /// Whether the client showed any inbound activity within `window`.
    pub fn recently_active(&self, window: Duration) -> bool {
        let idle = Utc::now().signed_duration_since(self.last_activity());
        idle.to_std().map(|idle| idle < window).unwrap_or(true)
    }

    pub fn is_alive(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).alive
    }

    /// Mark not-alive when a ping goes out; any pong or activity restores.
    pub fn mark_not_alive(&self) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).alive = false;
    }

    pub fn mark_alive(&self) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).alive = true;
    }

    /// Extend the subscription and session sets.
    pub fn subscribe(&self, events: Option<Vec<String>>, sessions: Option<Vec<String>>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(events) = events {
            state.subscriptions.extend(events);
        }
        if let Some(sessions) = sessions {
            state.sessions.extend(sessions);
        }
    }

    pub fn associate_session(&self, session_id: &str) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .insert(session_id.to_string());
    }

    pub fn dissociate_session(&self, session_id: &str) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .remove(session_id);
    }

    pub fn is_subscribed_to_session(&self, session_id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .contains(session_id)
    }

    /// Whether this client wants events of the given kind. An empty
    /// subscription set receives everything.
    pub fn wants_event(&self, kind: &str) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.subscriptions.is_empty() || state.subscriptions.contains(kind)
    }

    pub fn set_working_directory(&self, path: PathBuf) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .working_directory = Some(path);
    }

    pub fn working_directory(&self) -> Option<PathBuf> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .working_directory
            .clone()
    }

    pub fn bind_device(&self, token: String, info: Option<Value>) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .device = Some(DeviceBinding { token, info });
    }

    pub fn device(&self) -> Option<DeviceBinding> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .device
            .clone()
    }
}

/// All connected clients.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, Arc<ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<ClientHandle>) {
        debug!(client = %handle.id, "client registered");
        self.clients.insert(handle.id.clone(), handle);
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<ClientHandle>> {
        let removed = self.clients.remove(client_id).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!(client = %client_id, "client removed");
        }
        removed
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ClientHandle>> {
        self.clients.get(client_id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.iter().map(|entry| entry.clone()).collect()
    }

    /// Live clients subscribed to a session and interested in this event
    /// kind.
    pub fn subscribers_for(&self, session_id: &str, kind: &str) -> Vec<Arc<ClientHandle>> {
        self.clients
            .iter()
            .filter(|entry| {
                let client = entry.value();
                client.is_alive()
                    && client.is_subscribed_to_session(session_id)
                    && client.wants_event(kind)
            })
            .map(|entry| entry.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;

    fn handle(id: &str) -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ClientHandle::new(id.to_string(), tx)), rx)
    }

    #[test]
    fn send_queues_on_the_outbound_channel() {
        let (client, mut rx) = handle("c1");
        assert!(client.send(ServerEnvelope::event(ServerEvent::SessionExpired {
            session_id: "s1".to_string(),
        })));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn send_fails_after_receiver_drops() {
        let (client, rx) = handle("c1");
        drop(rx);
        assert!(!client.send(ServerEnvelope::event(ServerEvent::SessionExpired {
            session_id: "s1".to_string(),
        })));
    }

    #[test]
    fn empty_subscription_set_receives_everything() {
        let (client, _rx) = handle("c1");
        assert!(client.wants_event("assistantMessage"));
        client.subscribe(Some(vec!["toolUse".to_string()]), None);
        assert!(client.wants_event("toolUse"));
        assert!(!client.wants_event("assistantMessage"));
    }

    #[test]
    fn subscribers_require_session_liveness_and_interest() {
        let registry = ClientRegistry::new();
        let (subscribed, _rx1) = handle("c1");
        let (other, _rx2) = handle("c2");
        let (dead, _rx3) = handle("c3");

        subscribed.subscribe(None, Some(vec!["s1".to_string()]));
        dead.subscribe(None, Some(vec!["s1".to_string()]));
        dead.mark_not_alive();

        registry.register(subscribed.clone());
        registry.register(other);
        registry.register(dead);

        let found = registry.subscribers_for("s1", "assistantMessage");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "c1");
    }

    #[test]
    fn liveness_flag_round_trips() {
        let (client, _rx) = handle("c1");
        assert!(client.is_alive());
        client.mark_not_alive();
        assert!(!client.is_alive());
        client.touch();
        assert!(client.is_alive());
        assert!(client.recently_active(Duration::from_secs(30)));
    }
}

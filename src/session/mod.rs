//! Session lifecycle and routing.
//!
//! The manager exclusively owns [`Session`] lifetimes: creation (with reuse
//! by working directory), activity tracking, timeout warnings and expiry,
//! and the routing maps between working directories, internal session ids,
//! and the Agent CLI's own session ids.

pub mod buffer;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::paths::WORKSPACE_MARKER;
use agent_stream::PermissionProfile;

use self::buffer::SessionBuffer;

/// Maximum delivered events retained per session for `getMessageHistory`.
const HISTORY_CAPACITY: usize = 200;

/// Lifecycle events broadcast by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionLifecycleEvent {
    Warning {
        session_id: String,
        time_remaining: Duration,
    },
    Expired {
        session_id: String,
    },
    Cleaned {
        session_id: String,
        reason: String,
    },
}

#[derive(Debug)]
struct SessionState {
    last_activity: DateTime<Utc>,
    conversation_started: bool,
    external_agent_session_id: Option<String>,
    warning_sent: bool,
}

/// One conversation session.
///
/// Clients are referenced by id only; the gateway owns the client records,
/// so dropping a session can never leave a reference cycle behind.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    /// Resolved working directory used at spawn time.
    pub working_directory: PathBuf,
    /// The client-supplied directory string (may be the workspace marker).
    pub raw_working_directory: String,
    pub workspace: bool,
    pub profile: PermissionProfile,
    pub created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    processing: AtomicBool,
    buffer: Mutex<SessionBuffer>,
    /// Serializes turns: turn N+1 waits here until turn N is terminal.
    pub(crate) turn_gate: tokio::sync::Mutex<()>,
    cancel: Mutex<Option<CancellationToken>>,
    history: Mutex<VecDeque<Value>>,
}

impl Session {
    fn new(
        id: String,
        working_directory: PathBuf,
        raw_working_directory: String,
        profile: PermissionProfile,
    ) -> Self {
        let workspace = raw_working_directory == WORKSPACE_MARKER;
        Self {
            id,
            working_directory,
            raw_working_directory,
            workspace,
            profile,
            created_at: Utc::now(),
            state: RwLock::new(SessionState {
                last_activity: Utc::now(),
                conversation_started: false,
                external_agent_session_id: None,
                warning_sent: false,
            }),
            processing: AtomicBool::new(false),
            buffer: Mutex::new(SessionBuffer::new()),
            turn_gate: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    /// Update last activity. Monotonic: an older timestamp never wins.
    pub fn touch(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        if now > state.last_activity {
            state.last_activity = now;
        }
        state.warning_sent = false;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_activity
    }

    pub fn mark_conversation_started(&self) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .conversation_started = true;
    }

    pub fn conversation_started(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .conversation_started
    }

    pub fn external_agent_session_id(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .external_agent_session_id
            .clone()
    }

    pub fn set_external_agent_session_id(&self, external: String) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .external_agent_session_id = Some(external);
    }

    /// Whether a Process Invocation is currently running on this session.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn set_processing(&self, value: bool) {
        self.processing.store(value, Ordering::SeqCst);
    }

    /// Run a closure against the session's turn buffer.
    pub fn with_buffer<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut SessionBuffer) -> R,
    {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut buffer)
    }

    /// Install the cancellation token for the turn starting now.
    pub fn set_turn_cancel(&self, token: CancellationToken) {
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }

    pub fn clear_turn_cancel(&self) {
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Cancel the in-flight turn, if any.
    pub fn cancel_turn(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            token.cancel();
        }
    }

    /// Record a delivered event envelope for later history queries.
    pub fn push_history(&self, envelope: Value) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(envelope);
    }

    /// A slice of recorded history plus the total count.
    pub fn history_slice(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> (Vec<Value>, usize) {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let total = history.len();
        let offset = offset.unwrap_or(0).min(total);
        let limit = limit.unwrap_or(total);
        let slice = history.iter().skip(offset).take(limit).cloned().collect();
        (slice, total)
    }

    #[cfg(test)]
    fn backdate_activity(&self, seconds: i64) {
        let mut state = self.state.write().unwrap();
        state.last_activity = Utc::now() - chrono::Duration::seconds(seconds);
    }
}

/// Sanitize a client-supplied session id: keep `[A-Za-z0-9_-]`, replace the
/// rest, truncate to 64 chars. Empty input gets a generated id.
pub fn sanitize_session_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        cleaned
    }
}

/// Manages session lifetimes and routing maps.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    by_directory: DashMap<String, String>,
    /// Agent CLI session id -> internal session id.
    external_routes: DashMap<String, String>,
    /// Internal session id -> Agent CLI session id.
    internal_routes: DashMap<String, String>,
    max_sessions: usize,
    timeout: Duration,
    warning: Duration,
    events: broadcast::Sender<SessionLifecycleEvent>,
    /// Serializes create_session so concurrent starts for one working
    /// directory yield exactly one session.
    create_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(max_sessions: usize, timeout: Duration, warning: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: DashMap::new(),
            by_directory: DashMap::new(),
            external_routes: DashMap::new(),
            internal_routes: DashMap::new(),
            max_sessions,
            timeout,
            warning,
            events,
            create_lock: Mutex::new(()),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionLifecycleEvent> {
        self.events.subscribe()
    }

    /// Create a session, or reuse the one already bound to the working
    /// directory. Workspace mode never reuses.
    pub fn create_session(
        &self,
        requested_id: Option<&str>,
        working_directory: PathBuf,
        raw_working_directory: &str,
        profile: PermissionProfile,
    ) -> Result<(Arc<Session>, bool)> {
        let _creating = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        let workspace = raw_working_directory == WORKSPACE_MARKER;

        if let Some(requested) = requested_id {
            let id = sanitize_session_id(requested);
            if let Some(existing) = self.sessions.get(&id) {
                let session = existing.clone();
                drop(existing);
                session.touch();
                session.mark_conversation_started();
                return Ok((session, true));
            }
        }

        if !workspace {
            if let Some(existing_id) = self
                .by_directory
                .get(raw_working_directory)
                .map(|entry| entry.clone())
            {
                if let Some(existing) = self.sessions.get(&existing_id) {
                    let session = existing.clone();
                    drop(existing);
                    session.touch();
                    session.mark_conversation_started();
                    debug!(session = %session.id, dir = %raw_working_directory, "reusing session");
                    return Ok((session, true));
                }
                // Stale route left behind by a cleanup race.
                self.by_directory.remove(raw_working_directory);
            }
        }

        if self.sessions.len() >= self.max_sessions {
            return Err(BridgeError::session(
                requested_id.unwrap_or("new"),
                format!("session limit reached ({})", self.max_sessions),
            ));
        }

        let id = requested_id
            .map(sanitize_session_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Arc::new(Session::new(
            id.clone(),
            working_directory,
            raw_working_directory.to_string(),
            profile,
        ));

        self.sessions.insert(id.clone(), session.clone());
        if !workspace {
            self.by_directory
                .insert(raw_working_directory.to_string(), id.clone());
        }
        info!(session = %id, dir = %raw_working_directory, "session created");
        Ok((session, false))
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub fn has_active_session(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn list_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.clone()).collect()
    }

    /// Refresh activity; resets the timeout window.
    pub fn update_activity(&self, id: &str) -> Result<()> {
        let session = self
            .get_session(id)
            .ok_or_else(|| BridgeError::session_not_found(id))?;
        session.touch();
        Ok(())
    }

    pub fn mark_conversation_started(&self, id: &str) -> Result<()> {
        let session = self
            .get_session(id)
            .ok_or_else(|| BridgeError::session_not_found(id))?;
        session.mark_conversation_started();
        Ok(())
    }

    /// Remove a session from every map and announce the cleanup.
    pub fn close_session(&self, id: &str, reason: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if let Some(session) = &removed {
            self.by_directory
                .remove_if(&session.raw_working_directory, |_, mapped| mapped == id);
            if let Some((_, external)) = self.internal_routes.remove(id) {
                self.external_routes.remove(&external);
            }
            info!(session = %id, reason, "session closed");
            let _ = self.events.send(SessionLifecycleEvent::Cleaned {
                session_id: id.to_string(),
                reason: reason.to_string(),
            });
        }
        removed
    }

    /// Close a session and terminate any live Process Invocation.
    pub fn kill_session(&self, id: &str, reason: &str) -> Option<Arc<Session>> {
        if let Some(session) = self.get_session(id) {
            session.cancel_turn();
        }
        self.close_session(id, reason)
    }

    /// Establish the bidirectional mapping between an Agent CLI session id
    /// and an internal session id.
    pub fn track_for_routing(
        &self,
        external_id: &str,
        working_directory: &str,
        internal_id: Option<&str>,
    ) -> Result<()> {
        let internal = match internal_id {
            Some(id) => id.to_string(),
            None => self
                .by_directory
                .get(working_directory)
                .map(|entry| entry.clone())
                .ok_or_else(|| BridgeError::RoutingError {
                    message: format!("no session bound to {working_directory}"),
                })?,
        };

        if let Some(previous) = self
            .external_routes
            .insert(external_id.to_string(), internal.clone())
        {
            if previous != internal {
                // Last writer wins; the old binding is gone.
                warn!(
                    external = %external_id,
                    old = %previous,
                    new = %internal,
                    "external session id remapped"
                );
            }
        }
        self.internal_routes
            .insert(internal.clone(), external_id.to_string());
        if let Some(session) = self.get_session(&internal) {
            session.set_external_agent_session_id(external_id.to_string());
        }
        Ok(())
    }

    /// Internal session id for an Agent CLI session id.
    pub fn resolve_external(&self, external_id: &str) -> Option<String> {
        self.external_routes
            .get(external_id)
            .map(|entry| entry.clone())
    }

    /// One pass of the timeout sweep.
    ///
    /// Sessions that are processing or still have queued undelivered events
    /// are exempt from expiry (but not from the warning).
    pub fn sweep<F>(&self, has_queued: F) -> Vec<SessionLifecycleEvent>
    where
        F: Fn(&str) -> bool,
    {
        let now = Utc::now();
        let mut emitted = Vec::new();
        let mut expired = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            let idle = now
                .signed_duration_since(session.last_activity())
                .to_std()
                .unwrap_or_default();

            if idle >= self.timeout {
                if session.is_processing() || has_queued(&session.id) {
                    debug!(session = %session.id, "expiry skipped: busy or queued events");
                    continue;
                }
                expired.push(session.id.clone());
                continue;
            }

            if idle >= self.warning {
                let mut state = session.state.write().unwrap_or_else(|e| e.into_inner());
                if !state.warning_sent {
                    state.warning_sent = true;
                    let remaining = self.timeout.saturating_sub(idle);
                    emitted.push(SessionLifecycleEvent::Warning {
                        session_id: session.id.clone(),
                        time_remaining: remaining,
                    });
                }
            }
        }

        for id in expired {
            emitted.push(SessionLifecycleEvent::Expired {
                session_id: id.clone(),
            });
            self.close_session(&id, "expired");
        }

        for event in &emitted {
            let _ = self.events.send(event.clone());
        }
        emitted
    }
}

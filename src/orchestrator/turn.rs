//! The per-turn pipeline: spawn, parse, aggregate, deliver.
//!
//! One streaming turn is a single logical flow so per-session ordering is
//! preserved end to end. The session's turn gate serializes turns: turn N+1
//! does not spawn until turn N reached a terminal state.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::connection::ClientHandle;
use crate::protocol::{ServerEnvelope, ServerEvent};
use crate::session::Session;
use crate::{aggregate, orchestrator::Bridge};
use agent_stream::timeout::PROGRESS_INTERVAL;
use agent_stream::{AgentRecord, ProcessEvent, SpawnSpec, Supervisor, SupervisorError, TimeoutProfile};

/// Run one streaming turn on a session.
///
/// `client` and `request_id` identify the request that started the turn;
/// the long-running acknowledgement goes back on that channel as a direct
/// response, keeping the session's ordered stream for the real turn only.
pub(crate) async fn run_streaming_turn(
    bridge: Arc<Bridge>,
    session: Arc<Session>,
    prompt: String,
    client: Arc<ClientHandle>,
    request_id: Option<String>,
) {
    let profile = TimeoutProfile::for_prompt(&prompt);
    if profile.is_long_running() {
        // Immediate acknowledgement, before the turn gate: the caller must
        // not wait for a prior turn to learn the request went long-running.
        client.send(ServerEnvelope::response(
            request_id,
            ServerEvent::StreamChunk {
                session_id: session.id.clone(),
                record: json!({
                    "type": "status",
                    "subtype": "long_running_started",
                    "totalBudgetMs": profile.total_budget.as_millis() as u64,
                }),
            },
        ));
    }

    // Serialize turns per session.
    let _gate = session.turn_gate.lock().await;

    let cancel = CancellationToken::new();
    session.set_turn_cancel(cancel.clone());
    session.set_processing(true);
    session.touch();

    let outcome = execute_turn(&bridge, &session, &prompt, profile, cancel.clone()).await;

    match outcome {
        Ok(()) => {}
        Err(error) => {
            let reason = error.reason();
            warn!(session = %session.id, reason, "turn failed: {error}");
            // In-flight aggregation state is discarded for this turn.
            session.with_buffer(|buffer| buffer.clear(true));
            bridge.deliver(ServerEvent::StreamError {
                session_id: session.id.clone(),
                reason: reason.to_string(),
                message: Some(user_guidance(&error)),
                dropped: None,
            });
        }
    }

    session.set_processing(false);
    session.clear_turn_cancel();
    session.touch();
}

async fn execute_turn(
    bridge: &Arc<Bridge>,
    session: &Arc<Session>,
    prompt: &str,
    profile: TimeoutProfile,
    cancel: CancellationToken,
) -> Result<(), SupervisorError> {
    let program = bridge
        .agent_program()
        .await
        .map_err(|e| SupervisorError::Spawn(std::io::Error::other(e.to_string())))?;
    let args = session
        .profile
        .build_args(true)
        .map_err(|e| SupervisorError::Spawn(std::io::Error::other(e.to_string())))?;

    let spec = SpawnSpec {
        program,
        args,
        working_dir: session.working_directory.clone(),
        prompt: Some(prompt.to_string()),
        timeout: profile,
    };

    // Forward supervision health into the session's event stream.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ProcessEvent>();
    let health_bridge = bridge.clone();
    let health_session = session.id.clone();
    let health_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ProcessEvent::Health(snapshot) => {
                    if let Ok(metrics) = serde_json::to_value(&snapshot) {
                        health_bridge.deliver(ServerEvent::ProcessHealth {
                            session_id: health_session.clone(),
                            metrics,
                        });
                    }
                }
                ProcessEvent::Started { pid } => {
                    debug!(session = %health_session, pid, "agent process started");
                }
                ProcessEvent::Exit { code } => {
                    debug!(session = %health_session, ?code, "agent process exited");
                }
                _ => {}
            }
        }
    });

    // Periodic progress while a long-running turn is in flight.
    let progress_task = if profile.is_long_running() {
        let progress_bridge = bridge.clone();
        let progress_session = session.id.clone();
        let progress_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            let started = std::time::Instant::now();
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + PROGRESS_INTERVAL,
                PROGRESS_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = progress_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        progress_bridge.deliver(ServerEvent::StreamChunk {
                            session_id: progress_session.clone(),
                            record: json!({
                                "type": "status",
                                "subtype": "progress",
                                "elapsedMs": started.elapsed().as_millis() as u64,
                            }),
                        });
                    }
                }
            }
        }))
    } else {
        None
    };

    let result = Supervisor::new(spec)
        .with_events(events_tx)
        .with_cancellation(cancel.clone())
        .run()
        .await;

    // Stop the side tasks before touching the buffer.
    cancel.cancel();
    if let Some(task) = progress_task {
        let _ = task.await;
    }
    let _ = health_task.await;

    let output = result?;
    if output.partial {
        warn!(session = %session.id, "stream was salvaged partially; proceeding with recovered records");
    }

    for value in output.records {
        let record = AgentRecord::from_value(value);
        route_record(bridge, session, record);
    }
    info!(
        session = %session.id,
        duration_ms = output.duration.as_millis() as u64,
        "turn completed"
    );
    Ok(())
}

/// Route one classified record through aggregation and delivery.
fn route_record(bridge: &Arc<Bridge>, session: &Arc<Session>, record: AgentRecord) {
    // The Agent CLI announces its own session id in init and result
    // records; both feed the routing map.
    let external_id = match &record {
        AgentRecord::SystemInit(init) => init.session_id.clone(),
        AgentRecord::Result(result) => result.session_id.clone(),
        _ => None,
    };
    if let Some(external) = external_id {
        if let Err(error) = bridge.sessions.track_for_routing(
            &external,
            &session.raw_working_directory,
            Some(&session.id),
        ) {
            warn!(session = %session.id, "routing update failed: {error}");
        }
    }

    match record {
        AgentRecord::Result(result) => {
            let finalization =
                session.with_buffer(|buffer| aggregate::finalize(buffer, &session.id, &result));
            for event in finalization.events {
                bridge.deliver(event);
            }
            if finalization.deferred {
                info!(session = %session.id, "final delivery deferred pending permission");
            }
        }
        other => {
            let events =
                session.with_buffer(|buffer| aggregate::ingest(buffer, &session.id, &other));
            for event in events {
                bridge.deliver(event);
            }
        }
    }
}

/// Translate a turn failure into user-facing guidance.
fn user_guidance(error: &SupervisorError) -> String {
    match error {
        SupervisorError::BudgetTimeout { .. } | SupervisorError::SilenceTimeout { .. } => {
            "The operation timed out. Try breaking the request into smaller parts.".to_string()
        }
        SupervisorError::Cancelled => "The operation was cancelled.".to_string(),
        SupervisorError::EmptyOutput => {
            "The agent produced no output. Try rephrasing the request.".to_string()
        }
        SupervisorError::ExitNonZero { .. } => {
            "The agent exited with an error. Check the session and try again.".to_string()
        }
        other => other.to_string(),
    }
}

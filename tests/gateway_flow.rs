//! End-to-end flows through the orchestrator with a scripted fake agent.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use ccbridge::config::BridgeConfig;
use ccbridge::gateway::connection::ClientHandle;
use ccbridge::orchestrator::Bridge;
use ccbridge::protocol::{ServerEnvelope, ServerEvent};

struct Harness {
    bridge: Arc<Bridge>,
    root: TempDir,
}

impl Harness {
    /// A gateway in test mode whose agent is a shell script.
    fn with_agent_script(script_body: &str) -> Self {
        let root = TempDir::new().unwrap();
        let script = root.path().join("fake-agent.sh");
        {
            let mut file = std::fs::File::create(&script).unwrap();
            writeln!(file, "#!/bin/sh\ncat > /dev/null\n{script_body}").unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = BridgeConfig {
            safe_root: root.path().to_path_buf(),
            agent_cli_path: Some(script),
            test_mode: true,
            ..Default::default()
        };
        Self {
            bridge: Bridge::new(config),
            root,
        }
    }

    fn project_dir(&self) -> PathBuf {
        let dir = self.root.path().join("project");
        if !dir.exists() {
            std::fs::create_dir(&dir).unwrap();
        }
        dir
    }

    fn client(&self) -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(ClientHandle::new(
            format!("client-{}", uuid::Uuid::new_v4()),
            tx,
        ));
        self.bridge.clients.register(client.clone());
        (client, rx)
    }
}

async fn next_envelope(rx: &mut mpsc::UnboundedReceiver<ServerEnvelope>) -> ServerEnvelope {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for an envelope")
        .expect("outbound channel closed")
}

async fn next_event_of_kind(
    rx: &mut mpsc::UnboundedReceiver<ServerEnvelope>,
    kind: &str,
) -> ServerEnvelope {
    loop {
        let envelope = next_envelope(rx).await;
        if envelope.event.kind() == kind {
            return envelope;
        }
    }
}

#[tokio::test]
async fn ask_returns_the_result_record() {
    let harness = Harness::with_agent_script(
        r#"printf '{"type":"result","result":"4","is_error":false,"duration_ms":50}\n'"#,
    );
    let (client, mut rx) = harness.client();

    harness
        .bridge
        .handle_frame(&client, r#"{"type":"ask","requestId":"r1","data":{"prompt":"2+2?"}}"#)
        .await;

    let envelope = next_event_of_kind(&mut rx, "askResponse").await;
    assert_eq!(envelope.request_id.as_deref(), Some("r1"));
    match envelope.event {
        ServerEvent::AskResponse {
            success, response, ..
        } => {
            assert!(success);
            assert_eq!(response.unwrap()["result"], "4");
        }
        other => panic!("expected AskResponse, got {other:?}"),
    }
}

#[tokio::test]
async fn multi_block_stream_aggregates_one_final_before_result() {
    let harness = Harness::with_agent_script(concat!(
        r#"printf '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Hello"}]}}\n'"#,
        "\n",
        r#"printf '{"type":"assistant","message":{"id":"m2","content":[{"type":"text","text":"world"}]}}\n'"#,
        "\n",
        r#"printf '{"type":"result","result":"","is_error":false,"duration_ms":10}\n'"#,
    ));
    let (client, mut rx) = harness.client();
    let dir = harness.project_dir();

    let frame = serde_json::json!({
        "type": "streamStart",
        "requestId": "r1",
        "data": {"initialPrompt": "hi there", "workingDirectory": dir.to_str().unwrap()}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;

    let started = next_event_of_kind(&mut rx, "streamStarted").await;
    let session_id = match started.event {
        ServerEvent::StreamStarted { session_id, reused } => {
            assert!(!reused);
            session_id
        }
        other => panic!("expected StreamStarted, got {other:?}"),
    };

    let message = next_event_of_kind(&mut rx, "assistantMessage").await;
    match message.event {
        ServerEvent::AssistantMessage {
            session_id: sid,
            content,
            message_count,
            is_final,
            ..
        } => {
            assert_eq!(sid, session_id);
            assert!(is_final);
            assert_eq!(message_count, 2);
            assert_eq!(content.len(), 1);
            assert_eq!(content[0].text, "Hello\n\nworld");
        }
        other => panic!("expected AssistantMessage, got {other:?}"),
    }

    // The final precedes its conversationResult.
    let result = next_event_of_kind(&mut rx, "conversationResult").await;
    match result.event {
        ServerEvent::ConversationResult { success, .. } => assert!(success),
        other => panic!("expected ConversationResult, got {other:?}"),
    }
}

#[tokio::test]
async fn permission_cycle_defers_until_approval() {
    let harness = Harness::with_agent_script(concat!(
        r#"printf '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Would you like me to create the file? (y/n)"}]}}\n'"#,
        "\n",
        r#"printf '{"type":"result","result":"","is_error":false,"duration_ms":10}\n'"#,
    ));
    let (client, mut rx) = harness.client();
    let dir = harness.project_dir();

    let frame = serde_json::json!({
        "type": "streamStart",
        "data": {"initialPrompt": "hi there", "workingDirectory": dir.to_str().unwrap()}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;

    let request = next_event_of_kind(&mut rx, "permissionRequest").await;
    let session_id = match request.event {
        ServerEvent::PermissionRequest {
            session_id,
            prompt,
            options,
            default_option,
            ..
        } => {
            assert_eq!(prompt, "Would you like me to create the file?");
            assert_eq!(options, vec!["y", "n"]);
            assert_eq!(default_option, "n");
            session_id
        }
        other => panic!("expected PermissionRequest, got {other:?}"),
    };

    // Give the turn time to reach its (deferred) finalization.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let frame = serde_json::json!({
        "type": "permission",
        "requestId": "r2",
        "data": {"sessionId": session_id, "response": "yes"}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;

    let handled = next_event_of_kind(&mut rx, "permissionHandled").await;
    assert!(matches!(
        handled.event,
        ServerEvent::PermissionHandled { accepted: true, .. }
    ));

    // Stashed final and result arrive in order.
    let message = next_event_of_kind(&mut rx, "assistantMessage").await;
    assert!(matches!(
        message.event,
        ServerEvent::AssistantMessage { is_final: true, .. }
    ));
    let _ = next_event_of_kind(&mut rx, "conversationResult").await;
}

#[tokio::test]
async fn permission_denial_sends_canned_final_and_failed_result() {
    let harness = Harness::with_agent_script(concat!(
        r#"printf '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"May I delete the folder? (y/n)"}]}}\n'"#,
        "\n",
        r#"printf '{"type":"result","result":"","is_error":false,"duration_ms":10}\n'"#,
    ));
    let (client, mut rx) = harness.client();
    let dir = harness.project_dir();

    let frame = serde_json::json!({
        "type": "streamStart",
        "data": {"initialPrompt": "hi there", "workingDirectory": dir.to_str().unwrap()}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;

    let request = next_event_of_kind(&mut rx, "permissionRequest").await;
    let session_id = request.event.session_id().unwrap().to_string();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let frame = serde_json::json!({
        "type": "permission",
        "data": {"sessionId": session_id, "response": "no way"}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;

    let handled = next_event_of_kind(&mut rx, "permissionHandled").await;
    assert!(matches!(
        handled.event,
        ServerEvent::PermissionHandled {
            accepted: false,
            ..
        }
    ));

    let message = next_event_of_kind(&mut rx, "assistantMessage").await;
    match message.event {
        ServerEvent::AssistantMessage { content, .. } => {
            assert!(content[0].text.contains("won't proceed"));
        }
        other => panic!("expected AssistantMessage, got {other:?}"),
    }
    let result = next_event_of_kind(&mut rx, "conversationResult").await;
    assert!(matches!(
        result.event,
        ServerEvent::ConversationResult { success: false, .. }
    ));
}

#[tokio::test]
async fn malformed_stream_lines_are_salvaged() {
    // Line two carries two concatenated objects plus a truncated fragment;
    // both objects are recovered, the fragment is dropped, the turn
    // completes normally.
    let harness = Harness::with_agent_script(concat!(
        r#"printf '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"First"}]}}\n'"#,
        "\n",
        r#"printf '{"type":"assistant","message":{"id":"m2","content":[{"type":"text","text":"Second"}]}}{"type":"result","result":"","is_error":false,"duration_ms":5}{"type":"resu'"#,
    ));
    let (client, mut rx) = harness.client();
    let dir = harness.project_dir();

    let frame = serde_json::json!({
        "type": "streamStart",
        "data": {"initialPrompt": "hi there", "workingDirectory": dir.to_str().unwrap()}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;

    let message = next_event_of_kind(&mut rx, "assistantMessage").await;
    match message.event {
        ServerEvent::AssistantMessage {
            content,
            message_count,
            ..
        } => {
            assert_eq!(message_count, 2);
            assert_eq!(content[0].text, "First\n\nSecond");
        }
        other => panic!("expected AssistantMessage, got {other:?}"),
    }
    let _ = next_event_of_kind(&mut rx, "conversationResult").await;
}

#[tokio::test]
async fn same_directory_stream_start_reuses_the_session() {
    let harness = Harness::with_agent_script(
        r#"printf '{"type":"result","result":"ok","is_error":false}\n'"#,
    );
    let (client, mut rx) = harness.client();
    let dir = harness.project_dir();

    let frame = serde_json::json!({
        "type": "streamStart",
        "data": {"initialPrompt": "hi there", "workingDirectory": dir.to_str().unwrap()}
    })
    .to_string();

    harness.bridge.handle_frame(&client, &frame).await;
    let first = next_event_of_kind(&mut rx, "streamStarted").await;
    let first_id = match first.event {
        ServerEvent::StreamStarted { session_id, reused } => {
            assert!(!reused);
            session_id
        }
        other => panic!("expected StreamStarted, got {other:?}"),
    };

    harness.bridge.handle_frame(&client, &frame).await;
    let second = next_event_of_kind(&mut rx, "streamStarted").await;
    match second.event {
        ServerEvent::StreamStarted { session_id, reused } => {
            assert!(reused);
            assert_eq!(session_id, first_id);
        }
        other => panic!("expected StreamStarted, got {other:?}"),
    }
}

#[tokio::test]
async fn queued_events_replay_in_order_on_subscribe() {
    let harness = Harness::with_agent_script(
        r#"printf '{"type":"result","result":"ok","is_error":false}\n'"#,
    );
    let dir = harness.project_dir();

    // A session with events but no connected subscriber.
    let (session, _) = harness
        .bridge
        .sessions
        .create_session(
            Some("replay-session"),
            dir.clone(),
            dir.to_str().unwrap(),
            Default::default(),
        )
        .unwrap();

    for n in 1..=3 {
        harness.bridge.deliver(ServerEvent::AssistantMessage {
            session_id: session.id.clone(),
            content: vec![ccbridge::protocol::ContentPiece::text(format!("m{n}"))],
            deliverables: vec![],
            message_count: 1,
            is_final: true,
        });
    }
    harness.bridge.deliver(ServerEvent::ConversationResult {
        session_id: session.id.clone(),
        success: true,
        duration_ms: Some(5),
        cost_usd: None,
        usage: None,
    });
    assert_eq!(harness.bridge.queue.pending_count(&session.id), 4);

    // A client reconnects and subscribes: all four replay, in order.
    let (client, mut rx) = harness.client();
    let frame = serde_json::json!({
        "type": "subscribe",
        "data": {"sessionIds": [session.id]}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;

    let mut message_ids = Vec::new();
    for expected in ["m1", "m2", "m3"] {
        let envelope = next_event_of_kind(&mut rx, "assistantMessage").await;
        message_ids.push(envelope.message_id.clone().unwrap());
        match envelope.event {
            ServerEvent::AssistantMessage { content, .. } => {
                assert_eq!(content[0].text, expected);
            }
            other => panic!("expected AssistantMessage, got {other:?}"),
        }
    }
    let result = next_event_of_kind(&mut rx, "conversationResult").await;
    message_ids.push(result.message_id.clone().unwrap());

    // Acknowledgement empties the queue.
    let frame = serde_json::json!({
        "type": "acknowledgeMessages",
        "data": {"messageIds": message_ids}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;
    assert!(!harness.bridge.queue.has_pending(&session.id));
}

#[tokio::test]
async fn invalid_directory_is_rejected_with_a_path_code() {
    let harness = Harness::with_agent_script("true");
    let (client, mut rx) = harness.client();

    let frame = serde_json::json!({
        "type": "streamStart",
        "requestId": "r9",
        "data": {"initialPrompt": "hi", "workingDirectory": "/etc"}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;

    let envelope = next_event_of_kind(&mut rx, "error").await;
    assert_eq!(envelope.request_id.as_deref(), Some("r9"));
    match envelope.event {
        ServerEvent::Error(body) => {
            assert_eq!(body.code, ccbridge::error::ErrorCode::ForbiddenPath);
        }
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_session_yields_session_not_found() {
    let harness = Harness::with_agent_script("true");
    let (client, mut rx) = harness.client();

    let frame = serde_json::json!({
        "type": "streamSend",
        "data": {"sessionId": "ghost", "prompt": "hello"}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;

    let envelope = next_event_of_kind(&mut rx, "error").await;
    match envelope.event {
        ServerEvent::Error(body) => {
            assert_eq!(body.code, ccbridge::error::ErrorCode::SessionNotFound);
        }
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn agent_exit_failure_becomes_a_stream_error() {
    let harness = Harness::with_agent_script("echo agent blew up >&2\nexit 7");
    let (client, mut rx) = harness.client();
    let dir = harness.project_dir();

    let frame = serde_json::json!({
        "type": "streamStart",
        "data": {"initialPrompt": "hi there", "workingDirectory": dir.to_str().unwrap()}
    })
    .to_string();
    harness.bridge.handle_frame(&client, &frame).await;

    let envelope = next_event_of_kind(&mut rx, "streamError").await;
    match &envelope.event {
        ServerEvent::StreamError { reason, .. } => {
            assert_eq!(reason, "agent_exit_nonzero");
        }
        other => panic!("expected StreamError, got {other:?}"),
    }

    // The session survives the failed turn.
    let session_id = envelope.event.session_id().unwrap().to_string();
    assert!(harness.bridge.sessions.has_active_session(&session_id));
}

#[tokio::test]
async fn ping_pong_and_status_answer_locally() {
    let harness = Harness::with_agent_script("true");
    let (client, mut rx) = harness.client();

    harness
        .bridge
        .handle_frame(&client, r#"{"type":"ping","data":{"timestamp":42}}"#)
        .await;
    let pong = next_event_of_kind(&mut rx, "pong").await;
    assert!(matches!(
        pong.event,
        ServerEvent::Pong {
            timestamp: Some(42)
        }
    ));

    harness
        .bridge
        .handle_frame(
            &client,
            r#"{"type":"claudeCommand","data":{"command":"status"}}"#,
        )
        .await;
    let status = next_event_of_kind(&mut rx, "askResponse").await;
    match status.event {
        ServerEvent::AskResponse {
            success, response, ..
        } => {
            assert!(success);
            assert_eq!(response.unwrap()["sessions"], 0);
        }
        other => panic!("expected AskResponse, got {other:?}"),
    }
}

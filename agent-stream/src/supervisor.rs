//! One Agent CLI invocation: spawn, feed, watch, terminate, reconcile.
//!
//! The supervisor owns exactly one child process for the duration of a
//! conversation turn. Stdout and stderr are accumulated as raw byte chunks
//! and decoded once after exit, so multibyte sequences split across pipe
//! reads can never be corrupted. A heartbeat watches for silence: before the
//! first byte the full adaptive budget applies, afterwards a shorter silence
//! window that any output byte resets.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::parser::{self, ParseError};
use crate::timeout::{TimeoutProfile, HEALTH_INTERVAL, TERM_GRACE};

/// Everything needed to spawn one invocation.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Written to the child's stdin, which is then closed. `None` leaves
    /// stdin unattached.
    pub prompt: Option<String>,
    pub timeout: TimeoutProfile,
}

/// Heartbeat state of a running invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatState {
    /// No output observed yet; the full budget applies.
    Initial,
    /// At least one byte seen; the silence window applies.
    Streaming,
}

/// Periodic health metrics for a running invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub pid: Option<u32>,
    pub elapsed_ms: u64,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    pub stdout_chunks: usize,
    pub state: HeartbeatState,
    pub since_last_output_ms: Option<u64>,
}

/// Observable lifecycle events. Emitted, never returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Started { pid: u32 },
    Stdout { bytes: usize },
    Stderr { bytes: usize },
    Exit { code: Option<i32> },
    Error { message: String },
    Health(HealthSnapshot),
}

/// Terminal failure of an invocation.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to write prompt to agent stdin: {0}")]
    Stdin(#[source] io::Error),

    #[error("agent produced no output within the {after:?} budget")]
    BudgetTimeout { after: Duration },

    #[error("agent silent for {after:?} while streaming")]
    SilenceTimeout { after: Duration },

    #[error("turn cancelled")]
    Cancelled,

    #[error("agent exited with code {code}: {stderr}")]
    ExitNonZero { code: i32, stderr: String },

    #[error("agent exited successfully but produced no output")]
    EmptyOutput,

    #[error(transparent)]
    Truncated(#[from] ParseError),

    #[error("failed awaiting agent process: {0}")]
    Wait(#[source] io::Error),
}

impl SupervisorError {
    /// Short machine-readable reason for stream error events.
    pub fn reason(&self) -> &'static str {
        match self {
            SupervisorError::Spawn(_) => "spawn_failed",
            SupervisorError::Stdin(_) => "stdin_failed",
            SupervisorError::BudgetTimeout { .. } => "budget_timeout",
            SupervisorError::SilenceTimeout { .. } => "silence_timeout",
            SupervisorError::Cancelled => "cancelled",
            SupervisorError::ExitNonZero { .. } => "agent_exit_nonzero",
            SupervisorError::EmptyOutput => "empty_output",
            SupervisorError::Truncated(_) => "truncated_output",
            SupervisorError::Wait(_) => "wait_failed",
        }
    }
}

/// Reconciled output of a successful invocation.
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    /// Parsed records in stream order.
    pub records: Vec<Value>,
    /// True when the parser had to drop fragments.
    pub partial: bool,
    /// Full decoded stdout.
    pub stdout: String,
    /// Full decoded stderr.
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Supervises one Agent CLI invocation.
pub struct Supervisor {
    spec: SpawnSpec,
    events: Option<mpsc::UnboundedSender<ProcessEvent>>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(spec: SpawnSpec) -> Self {
        Self {
            spec,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach an event sink for observable lifecycle events.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Attach an external cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn emit(&self, event: ProcessEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Run the invocation to completion and reconcile its output.
    pub async fn run(self) -> Result<InvocationOutput, SupervisorError> {
        let start = Instant::now();

        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .current_dir(&self.spec.working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if self.spec.prompt.is_some() {
            command.stdin(std::process::Stdio::piped());
        } else {
            command.stdin(std::process::Stdio::null());
        }

        let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id();
        if let Some(pid) = pid {
            debug!(pid, program = %self.spec.program.display(), "agent process started");
            self.emit(ProcessEvent::Started { pid });
        }

        // Deliver the prompt and close stdin so the child sees EOF.
        if let Some(prompt) = &self.spec.prompt {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(prompt.as_bytes())
                    .await
                    .map_err(SupervisorError::Stdin)?;
                stdin.shutdown().await.map_err(SupervisorError::Stdin)?;
                drop(stdin);
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Spawn(io::Error::other("stdout not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::Spawn(io::Error::other("stderr not piped")))?;

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<(StreamKind, usize)>();
        let stdout_task = tokio::spawn(read_chunks(stdout, chunk_tx.clone(), StreamKind::Stdout));
        let stderr_task = tokio::spawn(read_chunks(stderr, chunk_tx, StreamKind::Stderr));

        let total_budget = self.spec.timeout.total_budget;
        let silence_budget = self.spec.timeout.silence_budget();
        let deadline = sleep_until(start + total_budget);
        tokio::pin!(deadline);
        let mut health = interval_at(start + HEALTH_INTERVAL, HEALTH_INTERVAL);

        let mut state = HeartbeatState::Initial;
        let mut stdout_bytes = 0usize;
        let mut stderr_bytes = 0usize;
        let mut stdout_chunks = 0usize;
        let mut last_output: Option<Instant> = None;
        let mut termination: Option<SupervisorError> = None;

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(SupervisorError::Wait)?;
                }
                Some((kind, bytes)) = chunk_rx.recv() => {
                    state = HeartbeatState::Streaming;
                    last_output = Some(Instant::now());
                    deadline.as_mut().reset(Instant::now() + silence_budget);
                    match kind {
                        StreamKind::Stdout => {
                            stdout_bytes += bytes;
                            stdout_chunks += 1;
                            self.emit(ProcessEvent::Stdout { bytes });
                        }
                        StreamKind::Stderr => {
                            stderr_bytes += bytes;
                            self.emit(ProcessEvent::Stderr { bytes });
                        }
                    }
                }
                _ = &mut deadline => {
                    let error = match state {
                        HeartbeatState::Initial => SupervisorError::BudgetTimeout {
                            after: total_budget,
                        },
                        HeartbeatState::Streaming => SupervisorError::SilenceTimeout {
                            after: silence_budget,
                        },
                    };
                    warn!(pid, reason = error.reason(), "terminating agent process");
                    termination = Some(error);
                    break terminate(&mut child).await.map_err(SupervisorError::Wait)?;
                }
                _ = self.cancel.cancelled() => {
                    debug!(pid, "turn cancelled, terminating agent process");
                    termination = Some(SupervisorError::Cancelled);
                    break terminate(&mut child).await.map_err(SupervisorError::Wait)?;
                }
                _ = health.tick() => {
                    self.emit(ProcessEvent::Health(HealthSnapshot {
                        pid,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                        stdout_bytes,
                        stderr_bytes,
                        stdout_chunks,
                        state,
                        since_last_output_ms: last_output
                            .map(|at| at.elapsed().as_millis() as u64),
                    }));
                }
            }
        };

        self.emit(ProcessEvent::Exit {
            code: status.code(),
        });

        // Pipes close at process exit; the readers drain whatever is left.
        let stdout_parts = stdout_task
            .await
            .map_err(|e| SupervisorError::Wait(io::Error::other(e)))?;
        let stderr_parts = stderr_task
            .await
            .map_err(|e| SupervisorError::Wait(io::Error::other(e)))?;

        if let Some(error) = termination {
            self.emit(ProcessEvent::Error {
                message: error.to_string(),
            });
            return Err(error);
        }

        // Reassemble from raw chunks and decode exactly once.
        let stdout_text = String::from_utf8_lossy(&stdout_parts.concat()).into_owned();
        let stderr_text = String::from_utf8_lossy(&stderr_parts.concat()).into_owned();
        let exit_code = status.code().unwrap_or(-1);
        let duration = start.elapsed();

        if exit_code != 0 {
            return Err(SupervisorError::ExitNonZero {
                code: exit_code,
                stderr: stderr_text,
            });
        }
        if stdout_text.trim().is_empty() {
            return Err(SupervisorError::EmptyOutput);
        }

        let outcome = parser::parse_complete(&stdout_text)?;
        Ok(InvocationOutput {
            records: outcome.records,
            partial: outcome.partial,
            stdout: stdout_text,
            stderr: stderr_text,
            exit_code,
            duration,
        })
    }
}

/// Read a pipe to EOF, collecting raw chunks and notifying per chunk.
async fn read_chunks<R>(
    mut reader: R,
    notify: mpsc::UnboundedSender<(StreamKind, usize)>,
    kind: StreamKind,
) -> Vec<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunks = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                chunks.push(buf[..n].to_vec());
                let _ = notify.send((kind, n));
            }
        }
    }
    chunks
}

/// SIGTERM, wait up to the grace period, SIGKILL if still alive. Always
/// collects the exit status.
async fn terminate(child: &mut Child) -> io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
            if let Ok(status) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
                return status;
            }
            warn!(pid, "SIGTERM grace expired, sending SIGKILL");
        }
    }
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-agent.sh");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh\n{body}").unwrap();
        }
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn spec(dir: &TempDir, program: PathBuf) -> SpawnSpec {
        SpawnSpec {
            program,
            args: Vec::new(),
            working_dir: dir.path().to_path_buf(),
            prompt: None,
            timeout: TimeoutProfile::one_shot(),
        }
    }

    #[tokio::test]
    async fn successful_invocation_yields_records() {
        let dir = TempDir::new().unwrap();
        let program = script(
            &dir,
            r#"printf '{"type":"result","result":"4","is_error":false,"duration_ms":50}\n'"#,
        );
        let output = Supervisor::new(spec(&dir, program)).run().await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.records.len(), 1);
        assert!(!output.partial);
        assert_eq!(output.records[0]["result"], "4");
    }

    #[tokio::test]
    async fn prompt_is_delivered_on_stdin() {
        let dir = TempDir::new().unwrap();
        let program = script(
            &dir,
            r#"read line
printf '{"type":"result","result":"%s"}\n' "$line""#,
        );
        let mut spawn = spec(&dir, program);
        spawn.prompt = Some("hello stdin\n".to_string());
        let output = Supervisor::new(spawn).run().await.unwrap();
        assert_eq!(output.records[0]["result"], "hello stdin");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "echo boom >&2\nexit 3");
        let err = Supervisor::new(spec(&dir, program)).run().await.unwrap_err();
        match err {
            SupervisorError::ExitNonZero { code, stderr } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected ExitNonZero, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_stdout_is_reported() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "exit 0");
        let err = Supervisor::new(spec(&dir, program)).run().await.unwrap_err();
        assert!(matches!(err, SupervisorError::EmptyOutput));
    }

    #[tokio::test]
    async fn budget_timeout_fires_without_output() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "sleep 30");
        let mut spawn = spec(&dir, program);
        spawn.timeout = TimeoutProfile {
            total_budget: Duration::from_millis(300),
            one_shot: true,
        };
        let started = std::time::Instant::now();
        let err = Supervisor::new(spawn).run().await.unwrap_err();
        assert!(matches!(err, SupervisorError::BudgetTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn silence_timeout_fires_after_streaming_stops() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, r#"printf '{"type":"assistant"}\n'
sleep 30"#);
        let mut spawn = spec(&dir, program);
        spawn.timeout = TimeoutProfile {
            total_budget: Duration::from_secs(3),
            one_shot: true,
        };
        let started = std::time::Instant::now();
        let err = Supervisor::new(spawn).run().await.unwrap_err();
        assert!(matches!(err, SupervisorError::SilenceTimeout { .. }));
        // Silence budget is 1s here; well under the 30s the script wanted.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn output_resets_the_silence_window() {
        let dir = TempDir::new().unwrap();
        // Emits a record every 400ms; silence budget is 1s, so the stream
        // must survive to completion.
        let program = script(
            &dir,
            r#"for i in 1 2 3 4; do printf '{"type":"assistant","n":%s}\n' "$i"; sleep 0.4; done
printf '{"type":"result","result":""}\n'"#,
        );
        let mut spawn = spec(&dir, program);
        spawn.timeout = TimeoutProfile {
            total_budget: Duration::from_secs(3),
            one_shot: true,
        };
        let output = Supervisor::new(spawn).run().await.unwrap();
        assert_eq!(output.records.len(), 5);
    }

    #[tokio::test]
    async fn cancellation_terminates_the_process() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "sleep 30");
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            let spawn = spec(&dir, program);
            tokio::spawn(async move {
                Supervisor::new(spawn)
                    .with_cancellation(cancel)
                    .run()
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SupervisorError::Cancelled));
    }

    #[tokio::test]
    async fn lifecycle_events_are_emitted() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, r#"printf '{"type":"result","result":"ok"}\n'"#);
        let (tx, mut rx) = mpsc::unbounded_channel();
        Supervisor::new(spec(&dir, program))
            .with_events(tx)
            .run()
            .await
            .unwrap();

        let mut saw_started = false;
        let mut saw_stdout = false;
        let mut saw_exit = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ProcessEvent::Started { .. } => saw_started = true,
                ProcessEvent::Stdout { bytes } => saw_stdout = bytes > 0,
                ProcessEvent::Exit { code } => saw_exit = code == Some(0),
                _ => {}
            }
        }
        assert!(saw_started && saw_stdout && saw_exit);
    }

    #[tokio::test]
    async fn multibyte_output_survives_chunk_boundaries() {
        let dir = TempDir::new().unwrap();
        let program = script(
            &dir,
            r#"printf '{"type":"result","result":"日本語のテキストです"}\n'"#,
        );
        let output = Supervisor::new(spec(&dir, program)).run().await.unwrap();
        assert_eq!(output.records[0]["result"], "日本語のテキストです");
    }
}

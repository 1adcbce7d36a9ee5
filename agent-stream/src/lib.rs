//! Agent CLI process supervision and stream-JSON parsing.
//!
//! This library owns everything that talks to a local command-line AI
//! assistant (the "Agent CLI"): building its argument vector from a
//! permission profile, locating the binary, spawning and supervising one
//! invocation per conversation turn, and tolerantly parsing the
//! newline-delimited JSON it streams on stdout.
//!
//! The library is deliberately free of any session or client notion; the
//! gateway layered on top owns those. One invocation in, one reconciled
//! record stream out.

pub mod args;
pub mod locate;
pub mod parser;
pub mod record;
pub mod supervisor;
pub mod timeout;

pub use args::{ArgsError, OutputFormat, PermissionMode, PermissionProfile};
pub use locate::{health_check, locate_agent_cli};
pub use parser::{ParseError, ParseOutcome, StreamJsonParser};
pub use record::{
    AgentRecord, AssistantMessage, ContentBlock, SystemInit, ToolResultRecord, ToolUseRecord,
    TurnResult,
};
pub use supervisor::{
    HealthSnapshot, HeartbeatState, InvocationOutput, ProcessEvent, SpawnSpec, Supervisor,
    SupervisorError,
};
pub use timeout::TimeoutProfile;

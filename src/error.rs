use serde::{Deserialize, Serialize};
use thiserror::Error;

use agent_stream::{ArgsError, ParseError, SupervisorError};

/// Machine-readable error codes carried in the wire error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidArgs,
    InvalidPath,
    ForbiddenPath,
    DirectoryNotFound,
    NotADirectory,
    PermissionDenied,
    SessionNotFound,
    SessionError,
    ClaudeError,
    TruncatedOutput,
    AgentExitNonzero,
    EmptyOutput,
    CommandFailed,
    RoutingError,
    HandlerError,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The serde rename is the canonical spelling.
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Main error type for the gateway with structured context.
///
/// Every variant maps onto exactly one wire [`ErrorCode`]; handler code
/// propagates `BridgeError` and the dispatch boundary translates it into an
/// error envelope.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("invalid arguments: {message}")]
    InvalidArgs {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid path: {message}")]
    InvalidPath { message: String },

    #[error("forbidden path: {path}")]
    ForbiddenPath { path: String },

    #[error("directory not found: {path}")]
    DirectoryNotFound { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("session error [{session_id}]: {message}")]
    Session {
        session_id: String,
        message: String,
    },

    #[error("agent error: {message}")]
    Agent {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("stream output truncated")]
    TruncatedOutput,

    #[error("agent exited with code {code}")]
    AgentExitNonZero { code: i32, stderr: String },

    #[error("agent produced no output")]
    EmptyOutput,

    #[error("command failed: {message}")]
    CommandFailed { message: String },

    #[error("routing error: {message}")]
    RoutingError { message: String },

    #[error("handler error: {message}")]
    Handler {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// The wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            BridgeError::InvalidArgs { .. } => ErrorCode::InvalidArgs,
            BridgeError::InvalidPath { .. } => ErrorCode::InvalidPath,
            BridgeError::ForbiddenPath { .. } => ErrorCode::ForbiddenPath,
            BridgeError::DirectoryNotFound { .. } => ErrorCode::DirectoryNotFound,
            BridgeError::NotADirectory { .. } => ErrorCode::NotADirectory,
            BridgeError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            BridgeError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            BridgeError::Session { .. } => ErrorCode::SessionError,
            BridgeError::Agent { .. } => ErrorCode::ClaudeError,
            BridgeError::TruncatedOutput => ErrorCode::TruncatedOutput,
            BridgeError::AgentExitNonZero { .. } => ErrorCode::AgentExitNonzero,
            BridgeError::EmptyOutput => ErrorCode::EmptyOutput,
            BridgeError::CommandFailed { .. } => ErrorCode::CommandFailed,
            BridgeError::RoutingError { .. } => ErrorCode::RoutingError,
            BridgeError::Handler { .. } => ErrorCode::HandlerError,
            BridgeError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Extra detail attached to the wire envelope, when available.
    pub fn details(&self) -> Option<String> {
        match self {
            BridgeError::AgentExitNonZero { stderr, .. } if !stderr.is_empty() => {
                Some(stderr.clone())
            }
            _ => None,
        }
    }

    /// Whether the session owning this error stays usable.
    pub fn session_survives(&self) -> bool {
        // Only internal invariant violations take the session down.
        !matches!(self, BridgeError::Internal { .. })
    }

    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn session<I: Into<String>, S: Into<String>>(session_id: I, message: S) -> Self {
        Self::Session {
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    pub fn session_not_found<I: Into<String>>(session_id: I) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    pub fn handler<S: Into<String>>(message: S) -> Self {
        Self::Handler {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }
}

impl From<ArgsError> for BridgeError {
    fn from(error: ArgsError) -> Self {
        BridgeError::InvalidArgs {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}

impl From<ParseError> for BridgeError {
    fn from(_: ParseError) -> Self {
        BridgeError::TruncatedOutput
    }
}

impl From<SupervisorError> for BridgeError {
    fn from(error: SupervisorError) -> Self {
        match error {
            SupervisorError::ExitNonZero { code, stderr } => {
                BridgeError::AgentExitNonZero { code, stderr }
            }
            SupervisorError::EmptyOutput => BridgeError::EmptyOutput,
            SupervisorError::Truncated(_) => BridgeError::TruncatedOutput,
            other => BridgeError::Agent {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_in_screaming_snake_case() {
        assert_eq!(ErrorCode::NotADirectory.to_string(), "NOT_A_DIRECTORY");
        assert_eq!(ErrorCode::AgentExitNonzero.to_string(), "AGENT_EXIT_NONZERO");
        assert_eq!(ErrorCode::HandlerError.to_string(), "HANDLER_ERROR");
        assert_eq!(ErrorCode::ClaudeError.to_string(), "CLAUDE_ERROR");
    }

    #[test]
    fn supervisor_errors_map_to_wire_codes() {
        let err: BridgeError = SupervisorError::EmptyOutput.into();
        assert_eq!(err.code(), ErrorCode::EmptyOutput);

        let err: BridgeError = SupervisorError::ExitNonZero {
            code: 2,
            stderr: "bad flag".to_string(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::AgentExitNonzero);
        assert_eq!(err.details().as_deref(), Some("bad flag"));

        let err: BridgeError = SupervisorError::Cancelled.into();
        assert_eq!(err.code(), ErrorCode::ClaudeError);
    }

    #[test]
    fn args_errors_become_invalid_args() {
        let err: BridgeError = ArgsError::UnknownFlag("--nope".to_string()).into();
        assert_eq!(err.code(), ErrorCode::InvalidArgs);
    }

    #[test]
    fn sessions_survive_user_errors() {
        assert!(BridgeError::invalid_request("bad").session_survives());
        assert!(!BridgeError::internal("corrupt state").session_survives());
    }
}

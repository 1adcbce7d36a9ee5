//! Agent CLI argument construction and validation.
//!
//! The prompt itself is never placed in argv: whenever `--print` is present
//! the supervisor delivers it on the child's standard input. This keeps
//! arbitrarily long prompts out of the process table and sidesteps quoting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters that are never allowed in an argument. The Agent CLI is spawned
/// directly (no shell), but an argument carrying any of these indicates a
/// prompt or tool pattern leaking into argv.
pub const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>',
];

/// Long flags the builder is allowed to emit. Anything else starting with
/// `--` is rejected so a malformed profile cannot smuggle options through.
const KNOWN_LONG_FLAGS: &[&str] = &[
    "--print",
    "--output-format",
    "--verbose",
    "--permission-mode",
    "--allowedTools",
    "--disallowedTools",
    "--dangerously-skip-permissions",
];

/// Validation failure while building or checking an argument vector.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    #[error("argument contains shell metacharacter {found:?}: {argument}")]
    Metacharacter { argument: String, found: char },

    #[error("unrecognized flag: {0}")]
    UnknownFlag(String),

    #[error("invalid permission mode: {0}")]
    InvalidMode(String),

    #[error("invalid output format: {0}")]
    InvalidFormat(String),
}

/// Permission mode forwarded to the Agent CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    /// Wire value passed to `--permission-mode`.
    pub fn as_flag_value(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }

    /// Parse a client-supplied mode string.
    pub fn parse(value: &str) -> Result<Self, ArgsError> {
        match value {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            "plan" => Ok(PermissionMode::Plan),
            other => Err(ArgsError::InvalidMode(other.to_string())),
        }
    }
}

/// Output format requested from the Agent CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Json,
    Text,
    Markdown,
    #[default]
    StreamJson,
}

impl OutputFormat {
    /// Wire value passed to `--output-format`.
    pub fn as_flag_value(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Text => "text",
            OutputFormat::Markdown => "markdown",
            OutputFormat::StreamJson => "stream-json",
        }
    }

    /// Parse a client-supplied format string.
    pub fn parse(value: &str) -> Result<Self, ArgsError> {
        match value {
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            "markdown" => Ok(OutputFormat::Markdown),
            "stream-json" => Ok(OutputFormat::StreamJson),
            other => Err(ArgsError::InvalidFormat(other.to_string())),
        }
    }
}

/// Permission profile a client attaches to a session or a one-shot ask.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionProfile {
    pub mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub skip_permissions: bool,
    pub output_format: OutputFormat,
}

impl PermissionProfile {
    /// Profile for a one-shot, non-streaming invocation.
    pub fn one_shot() -> Self {
        Self {
            output_format: OutputFormat::Json,
            ..Self::default()
        }
    }

    /// Build the argument vector for this profile.
    ///
    /// `streaming` selects the streaming invocation shape
    /// (`--output-format stream-json --verbose`); otherwise the profile's own
    /// output format is used. The returned argv is already validated.
    pub fn build_args(&self, streaming: bool) -> Result<Vec<String>, ArgsError> {
        let mut args: Vec<String> = vec!["--print".to_string(), "--output-format".to_string()];

        if streaming {
            args.push(OutputFormat::StreamJson.as_flag_value().to_string());
            args.push("--verbose".to_string());
        } else {
            args.push(self.output_format.as_flag_value().to_string());
        }

        if self.skip_permissions {
            // The skip flag supersedes mode and tool lists entirely.
            args.push("--dangerously-skip-permissions".to_string());
        } else {
            if self.mode != PermissionMode::Default {
                args.push("--permission-mode".to_string());
                args.push(self.mode.as_flag_value().to_string());
            }
            if !self.allowed_tools.is_empty() {
                args.push("--allowedTools".to_string());
                args.push(self.allowed_tools.join(","));
            }
            if !self.disallowed_tools.is_empty() {
                args.push("--disallowedTools".to_string());
                args.push(self.disallowed_tools.join(","));
            }
        }

        validate_args(&args)?;
        Ok(args)
    }
}

/// Validate an argument vector before it reaches the spawner.
///
/// Rejects any argument containing a shell metacharacter and any long flag
/// outside the known set.
pub fn validate_args(args: &[String]) -> Result<(), ArgsError> {
    for arg in args {
        if let Some(found) = arg.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
            return Err(ArgsError::Metacharacter {
                argument: arg.clone(),
                found,
            });
        }
        if arg.starts_with("--") && !KNOWN_LONG_FLAGS.contains(&arg.as_str()) {
            return Err(ArgsError::UnknownFlag(arg.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_builds_streaming_args() {
        let profile = PermissionProfile::default();
        let args = profile.build_args(true).unwrap();
        assert_eq!(
            args,
            vec!["--print", "--output-format", "stream-json", "--verbose"]
        );
    }

    #[test]
    fn one_shot_profile_uses_json_format() {
        let profile = PermissionProfile::one_shot();
        let args = profile.build_args(false).unwrap();
        assert_eq!(args, vec!["--print", "--output-format", "json"]);
    }

    #[test]
    fn skip_permissions_suppresses_mode_and_tool_lists() {
        let profile = PermissionProfile {
            mode: PermissionMode::AcceptEdits,
            allowed_tools: vec!["Read".to_string(), "Edit".to_string()],
            disallowed_tools: vec!["Bash".to_string()],
            skip_permissions: true,
            output_format: OutputFormat::StreamJson,
        };
        let args = profile.build_args(true).unwrap();
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.iter().any(|a| a == "--permission-mode"));
        assert!(!args.iter().any(|a| a == "--allowedTools"));
        assert!(!args.iter().any(|a| a == "--disallowedTools"));
    }

    #[test]
    fn non_default_mode_and_tool_lists_are_emitted() {
        let profile = PermissionProfile {
            mode: PermissionMode::Plan,
            allowed_tools: vec!["Read".to_string(), "Grep".to_string()],
            disallowed_tools: vec!["Write".to_string()],
            ..Default::default()
        };
        let args = profile.build_args(true).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("--permission-mode plan"));
        assert!(joined.contains("--allowedTools Read,Grep"));
        assert!(joined.contains("--disallowedTools Write"));
    }

    #[test]
    fn metacharacters_are_rejected() {
        for meta in SHELL_METACHARACTERS {
            let args = vec![format!("prompt with {meta} inside")];
            let err = validate_args(&args).unwrap_err();
            assert!(matches!(err, ArgsError::Metacharacter { found, .. } if found == *meta));
        }
    }

    #[test]
    fn tool_pattern_with_parens_is_rejected() {
        let profile = PermissionProfile {
            allowed_tools: vec!["Bash(git:*)".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            profile.build_args(true),
            Err(ArgsError::Metacharacter { .. })
        ));
    }

    #[test]
    fn unknown_long_flag_is_rejected() {
        let args = vec!["--frobnicate".to_string()];
        assert_eq!(
            validate_args(&args),
            Err(ArgsError::UnknownFlag("--frobnicate".to_string()))
        );
    }

    #[test]
    fn mode_and_format_parse_round_trip() {
        assert_eq!(
            PermissionMode::parse("acceptEdits").unwrap(),
            PermissionMode::AcceptEdits
        );
        assert!(PermissionMode::parse("yolo").is_err());
        assert_eq!(
            OutputFormat::parse("stream-json").unwrap(),
            OutputFormat::StreamJson
        );
        assert!(OutputFormat::parse("xml").is_err());
    }

    #[test]
    fn profile_deserializes_from_camel_case() {
        let json = r#"{
            "mode": "bypassPermissions",
            "allowedTools": ["Read"],
            "skipPermissions": false,
            "outputFormat": "stream-json"
        }"#;
        let profile: PermissionProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.mode, PermissionMode::BypassPermissions);
        assert_eq!(profile.allowed_tools, vec!["Read"]);
        assert_eq!(profile.output_format, OutputFormat::StreamJson);
    }
}

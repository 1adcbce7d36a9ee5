//! Agent CLI binary discovery.
//!
//! Resolution order: the `AGENT_CLI_PATH` environment variable, then a
//! `which` lookup, then a handful of common install locations.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Environment variable that pins the Agent CLI binary.
pub const AGENT_CLI_PATH_ENV: &str = "AGENT_CLI_PATH";

/// Common install locations probed as a last resort.
const COMMON_INSTALL_DIRS: &[&str] = &[
    "/usr/local/bin",
    "/opt/homebrew/bin",
    "/usr/bin",
];

/// Locate the Agent CLI binary for `agent` (e.g. `"claude"`).
pub async fn locate_agent_cli(agent: &str) -> Result<PathBuf> {
    if let Ok(path) = std::env::var(AGENT_CLI_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            debug!(path = %path.display(), "agent CLI pinned via {AGENT_CLI_PATH_ENV}");
            return Ok(path);
        }
        bail!(
            "{AGENT_CLI_PATH_ENV} points at {} which is not a file",
            path.display()
        );
    }

    if let Some(path) = which(agent).await {
        debug!(path = %path.display(), "agent CLI found on PATH");
        return Ok(path);
    }

    for dir in COMMON_INSTALL_DIRS {
        let candidate = PathBuf::from(dir).join(agent);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "agent CLI found in common install dir");
            return Ok(candidate);
        }
    }
    if let Some(home) = std::env::var_os("HOME") {
        for suffix in [".local/bin", ".npm-global/bin"] {
            let candidate = PathBuf::from(&home).join(suffix).join(agent);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "agent CLI found in home install dir");
                return Ok(candidate);
            }
        }
    }

    bail!("agent CLI '{agent}' not found; set {AGENT_CLI_PATH_ENV} or install it on PATH")
}

/// Resolve a command name through `which`.
async fn which(cmd: &str) -> Option<PathBuf> {
    let output = Command::new("which").arg(cmd).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// Verify the binary answers `--version` and return the version line.
pub async fn health_check(path: &std::path::Path) -> Result<String> {
    let output = Command::new(path)
        .arg("--version")
        .output()
        .await
        .with_context(|| format!("failed to execute {}", path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} --version failed: {}", path.display(), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

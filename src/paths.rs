//! Working-directory validation.
//!
//! Every client-supplied directory must resolve inside the configured safe
//! root and outside system paths. Validation happens before any session is
//! bound to the directory and again before the Agent CLI is spawned.

use std::path::{Component, Path, PathBuf};

use crate::error::BridgeError;

/// Marker a client sends to request workspace mode. Resolved to the safe
/// root at spawn time; directory reuse is disabled for it.
pub const WORKSPACE_MARKER: &str = "__workspace__";

/// System prefixes a working directory may never resolve into.
const FORBIDDEN_PREFIXES: &[&str] = &[
    "/etc", "/usr", "/bin", "/sbin", "/sys", "/proc", "/root",
];

/// Validate a client-supplied working directory against the safe root.
///
/// Rules: absolute, no `..` or `~` components, must exist, must be a
/// directory, must canonicalize inside `safe_root`, and must not resolve
/// into a system prefix. The workspace marker bypasses directory checks and
/// resolves to the safe root itself.
pub fn validate_working_directory(raw: &str, safe_root: &Path) -> Result<PathBuf, BridgeError> {
    if raw == WORKSPACE_MARKER {
        return Ok(safe_root.to_path_buf());
    }

    if raw.is_empty() {
        return Err(BridgeError::InvalidPath {
            message: "working directory is empty".to_string(),
        });
    }
    if raw.contains('~') {
        return Err(BridgeError::InvalidPath {
            message: "working directory must not contain '~'".to_string(),
        });
    }

    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(BridgeError::InvalidPath {
            message: format!("working directory must be absolute: {raw}"),
        });
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(BridgeError::InvalidPath {
            message: "working directory must not contain '..'".to_string(),
        });
    }

    let resolved = path.canonicalize().map_err(|_| BridgeError::DirectoryNotFound {
        path: raw.to_string(),
    })?;
    if !resolved.is_dir() {
        return Err(BridgeError::NotADirectory {
            path: raw.to_string(),
        });
    }

    for prefix in FORBIDDEN_PREFIXES {
        if resolved.starts_with(prefix) {
            return Err(BridgeError::ForbiddenPath {
                path: raw.to_string(),
            });
        }
    }

    // The safe root itself may be a symlink; compare canonical forms.
    let root = safe_root
        .canonicalize()
        .unwrap_or_else(|_| safe_root.to_path_buf());
    if !resolved.starts_with(&root) {
        return Err(BridgeError::ForbiddenPath {
            path: raw.to_string(),
        });
    }

    Ok(resolved)
}

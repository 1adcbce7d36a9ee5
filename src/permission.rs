//! Conversational permission detection and the approval recognizer.
//!
//! The Agent CLI sometimes asks for permission in plain prose instead of a
//! structured record. The coordinator spots those messages, extracts a
//! concise prompt for the client, and gates final delivery of the turn until
//! the client answers. At most one permission request is outstanding per
//! session; further permission-shaped text during the wait is coalesced.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canned reply delivered when the client denies a request.
pub const DENIAL_TEXT: &str =
    "Understood, I won't proceed with that action. Let me know if you'd like me to do anything else.";

/// Fallback prompt when no question line could be extracted.
const FALLBACK_PROMPT: &str = "Permission required to proceed";

/// Literal `(y/n)` / `[y/n]` markers, case-insensitive.
static YN_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[\(\[]\s*y\s*/\s*n\s*[\)\]]").expect("y/n marker regex"));

/// Trailing marker stripped from extracted prompts.
static TRAILING_YN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*[\(\[]\s*y\s*/\s*n\s*[\)\]]\s*$").expect("trailing y/n regex"));

/// Conversational stems that open a permission question.
static CONVERSATIONAL_STEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(would you like me to|should i|shall i|may i|can i|need write permissions?|need permissions)\b",
    )
    .expect("conversational stem regex")
});

/// Single keywords that mark permission-flavored text.
static PERMISSION_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(permission|approve|confirm)\b").expect("permission word regex"));

/// Exact-or-prefix approval words (prefix must be followed by space, period,
/// or comma).
const APPROVAL_STARTERS: &[&str] = &[
    "yes", "y", "yep", "yeah", "yup", "approved", "approve", "approval", "ok", "okay", "k",
    "sure", "fine", "good", "proceed", "continue", "go ahead", "do it", "execute", "run it",
    "confirm", "confirmed", "allow", "permit", "authorized",
];

/// Phrases that approve wherever they appear in the reply.
const APPROVAL_PHRASES: &[&str] = &[
    "go ahead",
    "go for it",
    "sounds good",
    "looks good",
    "that works",
    "let's do it",
    "please proceed",
    "please continue",
    "yes please",
    "absolutely",
    "definitely",
];

/// An outstanding permission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub session_id: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub default_option: String,
    pub created_at: DateTime<Utc>,
}

impl PermissionRequest {
    /// Build a request from permission-shaped assistant text.
    pub fn from_text(session_id: &str, text: &str) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            prompt: extract_prompt(text),
            options: vec!["y".to_string(), "n".to_string()],
            default_option: "n".to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Does this text ask the user for permission?
pub fn detect(text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    YN_MARKER.is_match(text) || CONVERSATIONAL_STEM.is_match(text) || PERMISSION_WORD.is_match(text)
}

/// Extract a concise permission prompt from assistant text.
///
/// Keeps the lines carrying a stem or ending in `?`; falls back to the last
/// paragraph if it is a question; falls back to a generic prompt otherwise.
/// Any trailing `(y/n)` marker is stripped.
pub fn extract_prompt(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && (CONVERSATIONAL_STEM.is_match(line)
                    || YN_MARKER.is_match(line)
                    || PERMISSION_WORD.is_match(line)
                    || line.ends_with('?'))
        })
        .collect();

    let raw = if !kept.is_empty() {
        kept.join("\n")
    } else {
        let last_paragraph = text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .last()
            .unwrap_or("");
        if last_paragraph.ends_with('?') {
            last_paragraph.to_string()
        } else {
            return FALLBACK_PROMPT.to_string();
        }
    };

    TRAILING_YN.replace(raw.trim(), "").trim().to_string()
}

/// Does this reply approve the pending request?
pub fn is_approval(response: &str) -> bool {
    let reply = response.trim().to_lowercase();
    if reply.is_empty() {
        return false;
    }

    for starter in APPROVAL_STARTERS {
        if reply == *starter {
            return true;
        }
        if let Some(rest) = reply.strip_prefix(starter) {
            if rest.starts_with(' ') || rest.starts_with('.') || rest.starts_with(',') {
                return true;
            }
        }
    }

    APPROVAL_PHRASES.iter().any(|phrase| reply.contains(phrase))
}

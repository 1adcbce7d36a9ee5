//! Adaptive timeout budgets for Agent CLI invocations.
//!
//! The total budget is derived from the prompt: heavyweight keywords and long
//! prompts buy more time. Once the process starts producing output the
//! budget hands over to a silence window; any byte on stdout or stderr
//! resets it.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

/// Keywords that mark a very complex request (full budget tier).
static VERY_COMPLEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(expert|comprehensive|thorough|complete|full|entire project|whole codebase|all files)\b")
        .expect("very-complex keyword regex")
});

/// Keywords that mark a complex request (middle budget tier).
static COMPLEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(review|analyze|audit|refactor|debug|document|test|benchmark|profile|optimize|migrate|implement|integrate)\b",
    )
    .expect("complex keyword regex")
});

/// Budget for one-shot, non-streaming invocations.
pub const ONE_SHOT_BUDGET: Duration = Duration::from_secs(30);
/// Budgets above this threshold make the turn long-running.
pub const LONG_RUNNING_THRESHOLD: Duration = Duration::from_secs(300);
/// Progress cadence for long-running turns.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(120);
/// Health snapshot cadence.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
/// Grace period between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

/// Silence windows never exceed this, however large the total budget.
const MAX_SILENCE: Duration = Duration::from_secs(180);

/// Timeout budget for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutProfile {
    /// Full budget applied while the process has produced no output.
    pub total_budget: Duration,
    /// One-shot invocations skip the long-running machinery entirely.
    pub one_shot: bool,
}

impl TimeoutProfile {
    /// Derive the budget from a prompt.
    pub fn for_prompt(prompt: &str) -> Self {
        let total_budget = if VERY_COMPLEX.is_match(prompt) {
            Duration::from_secs(600)
        } else if COMPLEX.is_match(prompt) || prompt.chars().count() > 200 {
            Duration::from_secs(300)
        } else if prompt.chars().count() > 50 {
            Duration::from_secs(180)
        } else {
            Duration::from_secs(120)
        };

        Self {
            total_budget,
            one_shot: false,
        }
    }

    /// Fixed budget for one-shot, non-streaming invocations.
    pub fn one_shot() -> Self {
        Self {
            total_budget: ONE_SHOT_BUDGET,
            one_shot: true,
        }
    }

    /// Silence window applied once the process is streaming:
    /// `min(total_budget / 3, 180s)`.
    pub fn silence_budget(&self) -> Duration {
        (self.total_budget / 3).min(MAX_SILENCE)
    }

    /// A turn exceeding the long-running threshold gets an immediate
    /// acknowledgement, periodic progress events, and asynchronous delivery.
    pub fn is_long_running(&self) -> bool {
        !self.one_shot && self.total_budget > LONG_RUNNING_THRESHOLD
    }
}

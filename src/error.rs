//! Error types for WAF rule-set updates.

use thiserror::Error;

/// Errors surfaced by the updater, the alarm handler and the push tool.
///
/// None of these are recovered locally. A failed conditional write never
/// takes effect, so the remote collection keeps its pre-mutation state.
#[derive(Error, Debug)]
pub enum WafError {
    /// Required identifiers or settings are missing or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The named IP set, Web ACL or pattern set does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The lock token was stale: another actor wrote first.
    #[error("Conflict: {0} was modified concurrently; re-run to fetch the latest version")]
    Conflict(String),

    /// Network or service fault, passed through unchanged.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An address, pattern or notification could not be used.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl WafError {
    /// Whether re-running the whole fetch-merge-write cycle may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, WafError::Conflict(_))
    }
}

//! Error taxonomy
//!
//! `Rejection` is returned to the submitter before any session exists.
//! `BuildFailed` is an operational failure of the sandbox builder; the orchestrator
//! turns it into a `build_failed` result. Everything else inside the session
//! machinery is plumbed through `anyhow` and ends up as `internal_error`.

use serde::Serialize;
use thiserror::Error;

/// Reasons a submission is refused without running anything
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Rejection {
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    #[error("runner is overloaded, retry later")]
    Overloaded,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Rejection {
    /// Stable snake_case name, used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::UnknownLanguage(_) => "unknown_language",
            Rejection::Overloaded => "overloaded",
            Rejection::InvalidInput(_) => "invalid_input",
        }
    }
}

/// The isolated environment for a language could not be constructed
#[derive(Debug, Clone, Error)]
#[error("sandbox build failed for {language}: {reason}")]
pub struct BuildFailed {
    pub language: String,
    pub reason: String,
}

//! Sandboxed multi-language code runner
//!
//! Accepts source code in one of several languages, makes sure an isolated
//! environment for that language exists, then builds and runs the code under
//! resource limits and returns the captured output with a status.

pub mod collector;
pub mod config;
pub mod core;
pub mod error;
pub mod jobs;
pub mod languages;
pub mod limiter;
pub mod orchestrator;
pub mod redis_manager;
pub mod sandbox;
pub mod session;

pub use crate::core::{ExecutionResult, ResultStatus, Submission};
pub use error::{BuildFailed, Rejection};
pub use languages::{LanguageRegistry, LanguageSpec};
pub use limiter::{LimitOverrides, ResourceLimits};
pub use orchestrator::{Orchestrator, OrchestratorConfig};

//! Core data types shared by the orchestrator and sessions

pub mod result;
pub mod submission;

pub use result::{ExecutionResult, ResultStatus};
pub use submission::Submission;

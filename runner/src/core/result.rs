use serde::{Deserialize, Serialize};
use std::fmt;

use crate::collector::CapturedStream;

/// Final status of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    /// Exited with a non-zero code
    RuntimeError,
    Timeout,
    MemoryExceeded,
    /// Killed by a signal (segfault, abort, ...) or a process-count breach
    Crashed,
    CompileError,
    /// The language sandbox could not be built (operational)
    BuildFailed,
    /// Failure inside the runner itself (operational)
    InternalError,
}

impl ResultStatus {
    /// Operational failures are the runner's fault, not the submitter's
    pub fn is_operational(&self) -> bool {
        matches!(self, ResultStatus::BuildFailed | ResultStatus::InternalError)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultStatus::Success => "success",
            ResultStatus::RuntimeError => "runtime_error",
            ResultStatus::Timeout => "timeout",
            ResultStatus::MemoryExceeded => "memory_exceeded",
            ResultStatus::Crashed => "crashed",
            ResultStatus::CompileError => "compile_error",
            ResultStatus::BuildFailed => "build_failed",
            ResultStatus::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one submission, produced exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Either stream hit the output ceiling
    pub truncated: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed_ms: u64,
    /// Best-effort peak resident memory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_kb: Option<u64>,
    /// Compiler output when the build step ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    /// Operator-facing detail (build/internal errors, limit notes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionResult {
    fn empty(status: ResultStatus) -> Self {
        Self {
            status,
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed_ms: 0,
            peak_memory_kb: None,
            compile_output: None,
            message: None,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::empty(ResultStatus::InternalError)
        }
    }

    pub fn build_failed(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::empty(ResultStatus::BuildFailed)
        }
    }

    pub fn compile_error(compile_output: String, elapsed_ms: u64) -> Self {
        Self {
            compile_output: Some(compile_output),
            elapsed_ms,
            ..Self::empty(ResultStatus::CompileError)
        }
    }

    /// Result carrying the captured streams of the run step
    pub fn with_streams(
        status: ResultStatus,
        stdout: CapturedStream,
        stderr: CapturedStream,
    ) -> Self {
        Self {
            truncated: stdout.truncated || stderr.truncated,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            ..Self::empty(status)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(ResultStatus::MemoryExceeded.to_string(), "memory_exceeded");
        assert_eq!(
            serde_json::to_string(&ResultStatus::CompileError).unwrap(),
            "\"compile_error\""
        );
        assert!(ResultStatus::BuildFailed.is_operational());
        assert!(!ResultStatus::Timeout.is_operational());
    }

    #[test]
    fn test_internal_error_serialization() {
        let result = ExecutionResult::internal_error("boom");
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["status"], "internal_error");
        assert_eq!(json["message"], "boom");
        assert!(json.get("exit_code").is_none());
    }
}

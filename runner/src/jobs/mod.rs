//! Worker jobs
//!
//! Wire types for the Redis ingress and the glue turning a job into a response.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{ExecutionResult, Submission};
use crate::error::Rejection;
use crate::orchestrator::Orchestrator;

/// Job received from the Redis queue
#[derive(Debug, Serialize, Deserialize)]
pub struct RunJob {
    pub request_id: String,
    #[serde(flatten)]
    pub submission: Submission,
}

/// What happened to a job
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RunOutcome {
    Completed(ExecutionResult),
    /// Refused before running; `status` is the rejection kind
    Rejected {
        status: &'static str,
        message: String,
    },
}

/// Response published for every job
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub request_id: String,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

impl RunResponse {
    pub fn rejected(request_id: String, rejection: &Rejection) -> Self {
        Self {
            request_id,
            outcome: RunOutcome::Rejected {
                status: rejection.kind(),
                message: rejection.to_string(),
            },
        }
    }
}

/// Run one job through the orchestrator; never fails
pub async fn process_run_job(orchestrator: &Orchestrator, job: RunJob) -> RunResponse {
    info!(
        "Received run job: request_id={}, language={}",
        job.request_id, job.submission.language
    );

    match orchestrator.submit(job.submission).await {
        Ok(result) => {
            info!(
                "Job {} finished: {} ({}ms)",
                job.request_id, result.status, result.elapsed_ms
            );
            RunResponse {
                request_id: job.request_id,
                outcome: RunOutcome::Completed(result),
            }
        }
        Err(rejection) => {
            warn!("Job {} rejected: {}", job.request_id, rejection);
            RunResponse::rejected(job.request_id, &rejection)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageRegistry;
    use crate::orchestrator::OrchestratorConfig;
    use crate::sandbox::ProcessBackend;
    use crate::session::SessionSettings;
    use std::sync::Arc;

    #[test]
    fn test_parse_job() {
        let job: RunJob = serde_json::from_str(
            r#"{"request_id":"r-1","language":"python","source":"print(1)","stdin":"x","limits":{"wall_time_ms":1000}}"#,
        )
        .unwrap();

        assert_eq!(job.request_id, "r-1");
        assert_eq!(job.submission.language, "python");
        assert_eq!(job.submission.stdin.as_deref(), Some("x"));
        assert_eq!(job.submission.limits.wall_time_ms, Some(1000));
    }

    #[test]
    fn test_rejection_wire_format() {
        let response = RunResponse::rejected("r-2".to_string(), &Rejection::Overloaded);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["request_id"], "r-2");
        assert_eq!(json["status"], "overloaded");
    }

    #[tokio::test]
    async fn test_process_run_job() {
        let root = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            workers: 1,
            queue_capacity: 1,
            session: SessionSettings {
                scratch_root: root.path().to_path_buf(),
                ..SessionSettings::default()
            },
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::new(
            LanguageRegistry::builtin().unwrap(),
            Arc::new(ProcessBackend::new()),
            config,
        );

        let job = RunJob {
            request_id: "r-3".to_string(),
            submission: Submission::new("sh", "echo ok"),
        };
        let json = serde_json::to_value(process_run_job(&orchestrator, job).await).unwrap();
        assert_eq!(json["request_id"], "r-3");
        assert_eq!(json["status"], "success");
        assert_eq!(json["stdout"], "ok\n");

        let job = RunJob {
            request_id: "r-4".to_string(),
            submission: Submission::new("cobol-9000", "x"),
        };
        let json = serde_json::to_value(process_run_job(&orchestrator, job).await).unwrap();
        assert_eq!(json["status"], "unknown_language");
    }
}

//! Orchestrator - the public entry point
//!
//! Accepts submissions, bounds concurrency, and routes each submission through
//! registry lookup, sandbox readiness, and one execution session.
//!
//! Admission is two-staged:
//! - a non-blocking pool of `workers + queue_capacity` permits (`Overloaded` when empty)
//! - a worker semaphore of `workers` permits that admitted submissions wait on

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::OutputChunk;
use crate::core::{ExecutionResult, Submission};
use crate::error::Rejection;
use crate::languages::{LanguageRegistry, LanguageSpec};
use crate::limiter::ResourceLimits;
use crate::sandbox::{SandboxBackend, SandboxBuilder};
use crate::session::{Session, SessionSettings};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Sessions executing at once
    pub workers: usize,
    /// Admitted submissions allowed to wait for a worker
    pub queue_capacity: usize,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub session: SessionSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 64,
            max_source_bytes: 64 * 1024,
            max_stdin_bytes: 1024 * 1024,
            session: SessionSettings::default(),
        }
    }
}

struct Inner {
    registry: RwLock<Arc<LanguageRegistry>>,
    builder: SandboxBuilder,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    config: OrchestratorConfig,
}

/// Cheap to clone; all clones share one worker pool and one builder
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        registry: LanguageRegistry,
        backend: Arc<dyn SandboxBackend>,
        config: OrchestratorConfig,
    ) -> Self {
        let workers = config.workers.max(1);
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Arc::new(registry)),
                builder: SandboxBuilder::new(backend),
                admission: Arc::new(Semaphore::new(workers + config.queue_capacity)),
                workers: Arc::new(Semaphore::new(workers)),
                config,
            }),
        }
    }

    /// Snapshot of the current registry
    pub async fn registry(&self) -> Arc<LanguageRegistry> {
        self.inner.registry.read().await.clone()
    }

    /// Swap in a new registry; changed languages get rebuilt on next use
    pub async fn reload_registry(&self, registry: LanguageRegistry) {
        let languages = registry.len();
        *self.inner.registry.write().await = Arc::new(registry);
        info!("Language registry reloaded ({} languages)", languages);
    }

    pub fn builder(&self) -> &SandboxBuilder {
        &self.inner.builder
    }

    /// Admitted submissions not yet finished (running or waiting for a worker)
    pub fn in_flight(&self) -> usize {
        let total = self.inner.config.workers.max(1) + self.inner.config.queue_capacity;
        total - self.inner.admission.available_permits()
    }

    /// Run one submission to completion
    pub async fn submit(&self, submission: Submission) -> Result<ExecutionResult, Rejection> {
        self.dispatch(submission, CancellationToken::new(), None).await
    }

    /// Like [`submit`](Self::submit); cancelling `cancel` stops the session early
    pub async fn submit_with_cancel(
        &self,
        submission: Submission,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, Rejection> {
        self.dispatch(submission, cancel, None).await
    }

    /// Like [`submit`](Self::submit), forwarding live output while the program runs
    pub async fn submit_streaming(
        &self,
        submission: Submission,
        forward: mpsc::Sender<OutputChunk>,
    ) -> Result<ExecutionResult, Rejection> {
        self.dispatch(submission, CancellationToken::new(), Some(forward))
            .await
    }

    async fn dispatch(
        &self,
        submission: Submission,
        cancel: CancellationToken,
        forward: Option<mpsc::Sender<OutputChunk>>,
    ) -> Result<ExecutionResult, Rejection> {
        // Unknown languages are refused before any sandbox work
        let spec = self.registry().await.resolve(&submission.language)?;
        submission.validate(
            self.inner.config.max_source_bytes,
            self.inner.config.max_stdin_bytes,
        )?;
        let limits = spec.run_limits(&submission.limits)?;

        let admission = self
            .inner
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| {
                warn!("Rejecting {} submission: queue is full", spec.id);
                Rejection::Overloaded
            })?;

        // Dropping the caller's future cancels the session
        let token = cancel.child_token();
        let guard = token.clone().drop_guard();

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let _admission = admission;
            let _worker = match inner.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return ExecutionResult::internal_error("worker pool closed"),
            };
            inner.run_session(submission, spec, limits, token, forward).await
        });

        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Session task failed: {}", e);
                ExecutionResult::internal_error(format!("session task failed: {}", e))
            }
        };
        guard.disarm();
        Ok(result)
    }
}

impl Inner {
    async fn run_session(
        &self,
        submission: Submission,
        spec: Arc<LanguageSpec>,
        limits: ResourceLimits,
        cancel: CancellationToken,
        forward: Option<mpsc::Sender<OutputChunk>>,
    ) -> ExecutionResult {
        let handle = match self.builder.ensure_ready(&spec).await {
            Ok(handle) => handle,
            Err(e) => return ExecutionResult::build_failed(e.to_string()),
        };
        debug!("Using sandbox {:?}", handle);

        let session = match Session::stage(
            submission,
            spec,
            limits,
            handle,
            self.builder.backend().clone(),
            self.config.session.clone(),
        )
        .await
        {
            Ok(session) => session.with_cancel(cancel),
            Err(e) => {
                error!("Failed to stage session: {:#}", e);
                return ExecutionResult::internal_error(format!("{:#}", e));
            }
        };

        match forward {
            Some(forward) => session.with_forward(forward).run().await,
            None => session.run().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CapturedStream;
    use crate::core::ResultStatus;
    use crate::limiter::{LimitOverrides, Termination};
    use crate::sandbox::builder::tests::CountingBackend;
    use crate::sandbox::{ExecOutcome, ExecRequest, ProcessBackend, SandboxHandle, SandboxImage};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const TABLE: &str = r#"
[sh]
extension = "sh"
run_command = "sh {source}"
"#;

    /// Backend whose runs block until the test opens the gate
    struct GatedBackend {
        gate: Semaphore,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl Default for GatedBackend {
        fn default() -> Self {
            Self {
                gate: Semaphore::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SandboxBackend for GatedBackend {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn build(&self, _spec: &LanguageSpec) -> Result<SandboxImage> {
            Ok(SandboxImage {
                reference: "gated".to_string(),
                path: "/bin".to_string(),
            })
        }

        async fn prepare_scratch(&self, _workdir: &Path) -> Result<()> {
            Ok(())
        }

        async fn exec(&self, _handle: &SandboxHandle, _request: ExecRequest<'_>) -> Result<ExecOutcome> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ExecOutcome {
                termination: Termination::Exited(0),
                stdout: CapturedStream::default(),
                stderr: CapturedStream::default(),
                elapsed: Duration::from_millis(1),
                peak_memory_kb: None,
            })
        }
    }

    /// Backend that panics mid-session
    struct PanickingBackend;

    #[async_trait]
    impl SandboxBackend for PanickingBackend {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn build(&self, _spec: &LanguageSpec) -> Result<SandboxImage> {
            Ok(SandboxImage {
                reference: "panicking".to_string(),
                path: "/bin".to_string(),
            })
        }

        async fn prepare_scratch(&self, _workdir: &Path) -> Result<()> {
            Ok(())
        }

        async fn exec(&self, _handle: &SandboxHandle, _request: ExecRequest<'_>) -> Result<ExecOutcome> {
            panic!("backend exploded")
        }
    }

    fn orchestrator(
        backend: Arc<dyn SandboxBackend>,
        workers: usize,
        queue_capacity: usize,
    ) -> (Orchestrator, TempDir) {
        let root = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            workers,
            queue_capacity,
            max_source_bytes: 4096,
            max_stdin_bytes: 4096,
            session: SessionSettings {
                scratch_root: root.path().to_path_buf(),
                max_output_bytes: 4096,
                sample_interval: Duration::from_millis(20),
            },
        };
        let registry = LanguageRegistry::from_toml_str(TABLE).unwrap();
        (Orchestrator::new(registry, backend, config), root)
    }

    #[tokio::test]
    async fn test_unknown_language_rejected_without_build() {
        let backend = Arc::new(CountingBackend::default());
        let (orchestrator, _root) = orchestrator(backend.clone(), 2, 2);

        let err = orchestrator
            .submit(Submission::new("cobol-9000", "DISPLAY 'HI'."))
            .await
            .unwrap_err();

        assert_eq!(err, Rejection::UnknownLanguage("cobol-9000".to_string()));
        assert_eq!(backend.builds.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let (orchestrator, _root) = orchestrator(Arc::new(CountingBackend::default()), 2, 2);

        let err = orchestrator.submit(Submission::new("sh", "")).await.unwrap_err();
        assert!(matches!(err, Rejection::InvalidInput(_)));

        let zero = LimitOverrides {
            memory_mb: Some(0),
            ..LimitOverrides::default()
        };
        let err = orchestrator
            .submit(Submission::new("sh", "echo hi").with_limits(zero))
            .await
            .unwrap_err();
        assert!(matches!(err, Rejection::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_overload_rejects_beyond_queue() {
        let backend = Arc::new(GatedBackend::default());
        let (orchestrator, _root) = orchestrator(backend.clone(), 10, 20);

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator
                        .submit(Submission::new("sh", format!("echo {}", i)))
                        .await
                })
            })
            .collect();

        // Wait until every submission is either admitted or refused
        for _ in 0..250 {
            let finished = handles.iter().filter(|h| h.is_finished()).count();
            if orchestrator.in_flight() == 30 && finished == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(orchestrator.in_flight(), 30);

        backend.gate.add_permits(50);

        let mut completed = 0;
        let mut overloaded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(result) => {
                    assert_eq!(result.status, ResultStatus::Success);
                    completed += 1;
                }
                Err(Rejection::Overloaded) => overloaded += 1,
                Err(other) => panic!("unexpected rejection {:?}", other),
            }
        }

        assert_eq!(completed, 30);
        assert_eq!(overloaded, 20);
        assert!(backend.max_running.load(Ordering::SeqCst) <= 10);
        assert_eq!(orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_build_failure_becomes_result() {
        let backend = Arc::new(CountingBackend::default());
        backend.fail.store(true, Ordering::SeqCst);
        let (orchestrator, _root) = orchestrator(backend, 2, 2);

        let result = orchestrator
            .submit(Submission::new("sh", "echo hi"))
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::BuildFailed);
        assert!(result.message.unwrap().contains("broken"));
    }

    #[tokio::test]
    async fn test_panicking_session_becomes_internal_error() {
        let (orchestrator, _root) = orchestrator(Arc::new(PanickingBackend), 2, 2);

        let result = orchestrator
            .submit(Submission::new("sh", "echo hi"))
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::InternalError);
        assert_eq!(orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_with_process_backend() {
        let (orchestrator, root) = orchestrator(Arc::new(ProcessBackend::new()), 2, 2);

        let result = orchestrator
            .submit(Submission::new("sh", "cat").with_stdin("echo me"))
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.stdout, "echo me");
        // No scratch area survives the session
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_submit_with_cancel() {
        let (orchestrator, _root) = orchestrator(Arc::new(ProcessBackend::new()), 2, 2);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let result = orchestrator
            .submit_with_cancel(Submission::new("sh", "sleep 30"), cancel)
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Timeout);
        assert_eq!(result.message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_reload_registry() {
        let (orchestrator, _root) = orchestrator(Arc::new(ProcessBackend::new()), 2, 2);
        assert!(orchestrator.submit(Submission::new("bash-ish", "echo")).await.is_err());

        let table = r#"
[sh]
extension = "sh"
aliases = ["bash-ish"]
run_command = "sh {source}"
"#;
        orchestrator
            .reload_registry(LanguageRegistry::from_toml_str(table).unwrap())
            .await;

        let result = orchestrator
            .submit(Submission::new("bash-ish", "echo reloaded"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "reloaded\n");
    }
}

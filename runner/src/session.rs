//! Execution session
//!
//! One submission's lifecycle: stage the source into a private scratch area,
//! optionally build it, run it under limits, collect output, clean up.
//!
//! `Staged -> Building? -> Running -> Collecting -> Done`, or `Failed` from any
//! non-terminal state. The scratch area is removed on every path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::OutputChunk;
use crate::core::{ExecutionResult, ResultStatus, Submission};
use crate::languages::LanguageSpec;
use crate::limiter::{Limiter, ResourceLimits, Termination};
use crate::sandbox::{ExecOutcome, ExecRequest, SandboxBackend, SandboxHandle};

/// Staged stdin file name inside the scratch area
const STDIN_FILE: &str = ".stdin";

/// Peak memory ratio above which a crash is attributed to memory exhaustion
const MEMORY_CRASH_RATIO: f64 = 0.9;

/// What runtimes print when an allocation is refused
const ALLOCATION_FAILURES: &[&str] = &[
    "std::bad_alloc",
    "Cannot allocate memory",
    "out of memory",
    "MemoryError",
    "OutOfMemoryError",
];

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Staged,
    Building,
    Running,
    Collecting,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }

    /// Transitions only ever move forward
    pub fn can_advance_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Staged, Building)
                | (Staged, Running)
                | (Building, Running)
                | (Running, Collecting)
                | (Collecting, Done)
                | (Staged | Building | Running | Collecting, Failed)
        )
    }
}

/// Knobs shared by every session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Parent directory of per-session scratch areas
    pub scratch_root: PathBuf,
    /// Per-stream output ceiling
    pub max_output_bytes: usize,
    /// How often memory and process count are sampled
    pub sample_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir().join("runner"),
            max_output_bytes: 64 * 1024,
            sample_interval: Duration::from_millis(50),
        }
    }
}

pub struct Session {
    label: String,
    spec: Arc<LanguageSpec>,
    handle: SandboxHandle,
    backend: Arc<dyn SandboxBackend>,
    limits: ResourceLimits,
    settings: SessionSettings,
    scratch: Option<TempDir>,
    stdin: Option<PathBuf>,
    state: SessionState,
    forward: Option<mpsc::Sender<OutputChunk>>,
    cancel: CancellationToken,
}

impl Session {
    /// Create the scratch area and write the submission into it
    pub async fn stage(
        submission: Submission,
        spec: Arc<LanguageSpec>,
        limits: ResourceLimits,
        handle: SandboxHandle,
        backend: Arc<dyn SandboxBackend>,
        settings: SessionSettings,
    ) -> Result<Self> {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}-{}", spec.id, seq);

        tokio::fs::create_dir_all(&settings.scratch_root)
            .await
            .with_context(|| format!("Failed to create scratch root {:?}", settings.scratch_root))?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", label))
            .tempdir_in(&settings.scratch_root)
            .context("Failed to create scratch directory")?;

        tokio::fs::write(scratch.path().join(&spec.source_file), &submission.source)
            .await
            .context("Failed to stage source")?;

        let stdin = match &submission.stdin {
            Some(data) => {
                let path = scratch.path().join(STDIN_FILE);
                tokio::fs::write(&path, data)
                    .await
                    .context("Failed to stage stdin")?;
                Some(path)
            }
            None => None,
        };

        backend.prepare_scratch(scratch.path()).await?;
        debug!("[{}] Staged in {:?}", label, scratch.path());

        Ok(Self {
            label,
            spec,
            handle,
            backend,
            limits,
            settings,
            scratch: Some(scratch),
            stdin,
            state: SessionState::Staged,
            forward: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Forward live output chunks of the run step
    pub fn with_forward(mut self, forward: mpsc::Sender<OutputChunk>) -> Self {
        self.forward = Some(forward);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|dir| dir.path())
    }

    fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            anyhow::bail!(
                "Illegal session transition {:?} -> {:?} in {}",
                self.state,
                next,
                self.label
            );
        }
        self.state = next;
        Ok(())
    }

    /// Drive the session to a terminal state; always yields a result
    pub async fn run(mut self) -> ExecutionResult {
        let result = self.run_to_end().await;

        self.cleanup();
        info!(
            "[{}] {} in {}ms",
            self.label, result.status, result.elapsed_ms
        );
        result
    }

    /// Execute and settle on `Done` or `Failed`, leaving the scratch area in place
    async fn run_to_end(&mut self) -> ExecutionResult {
        match self.execute().await {
            Ok(result) => {
                // Builds that fail and runs stopped by time or cancellation end as failed
                let terminal = match result.status {
                    ResultStatus::CompileError | ResultStatus::Timeout => SessionState::Failed,
                    _ => SessionState::Done,
                };
                match self.advance(terminal) {
                    Ok(()) => result,
                    Err(e) => {
                        self.state = SessionState::Failed;
                        ExecutionResult::internal_error(format!("{:#}", e))
                    }
                }
            }
            Err(e) => {
                warn!("[{}] Session failed: {:#}", self.label, e);
                self.state = SessionState::Failed;
                ExecutionResult::internal_error(format!("{:#}", e))
            }
        }
    }

    async fn execute(&mut self) -> Result<ExecutionResult> {
        let workdir = self
            .workdir()
            .context("Session has no scratch area")?
            .to_path_buf();

        let mut compile_output = None;
        if let Some(command) = self.spec.expanded_build_command() {
            self.advance(SessionState::Building)?;
            let build_limits = self
                .spec
                .build_limits
                .unwrap_or_else(ResourceLimits::build_default);
            let limiter = Limiter::new(build_limits, self.settings.sample_interval);

            let outcome = self
                .backend
                .exec(
                    &self.handle,
                    ExecRequest {
                        label: &self.label,
                        spec: &self.spec,
                        command,
                        workdir: &workdir,
                        stdin: None,
                        limiter: &limiter,
                        max_output_bytes: self.settings.max_output_bytes,
                        forward: None,
                        cancel: &self.cancel,
                    },
                )
                .await
                .context("Build step could not be executed")?;

            if outcome.termination == Termination::Cancelled {
                return Ok(interpret(outcome, &build_limits, false));
            }
            if !outcome.termination.is_success() {
                debug!("[{}] Build failed: {:?}", self.label, outcome.termination);
                let elapsed_ms = outcome.elapsed.as_millis() as u64;
                return Ok(ExecutionResult::compile_error(
                    compile_output_of(&outcome),
                    elapsed_ms,
                ));
            }

            let warnings = compile_output_of(&outcome);
            if !warnings.is_empty() {
                compile_output = Some(warnings);
            }
        }

        self.advance(SessionState::Running)?;
        let limiter = Limiter::new(self.limits, self.settings.sample_interval);
        let outcome = self
            .backend
            .exec(
                &self.handle,
                ExecRequest {
                    label: &self.label,
                    spec: &self.spec,
                    command: self.spec.expanded_run_command(),
                    workdir: &workdir,
                    stdin: self.stdin.as_deref(),
                    limiter: &limiter,
                    max_output_bytes: self.settings.max_output_bytes,
                    forward: self.forward.clone(),
                    cancel: &self.cancel,
                },
            )
            .await
            .context("Run step could not be executed")?;

        self.advance(SessionState::Collecting)?;
        let mut result = interpret(outcome, &self.limits, self.spec.limit_address_space);
        result.compile_output = compile_output;
        Ok(result)
    }

    fn cleanup(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            let path = scratch.path().to_path_buf();
            if let Err(e) = scratch.close() {
                warn!("[{}] Failed to remove scratch {:?}: {}", self.label, path, e);
            }
        }
    }
}

/// Compiler diagnostics: stderr, else stdout, else a note on how the build ended
fn compile_output_of(outcome: &ExecOutcome) -> String {
    let stderr = outcome.stderr.as_lossy_str();
    if !stderr.trim().is_empty() {
        return stderr.into_owned();
    }
    let stdout = outcome.stdout.as_lossy_str();
    if !stdout.trim().is_empty() {
        return stdout.into_owned();
    }
    match outcome.termination {
        Termination::Exited(0) => String::new(),
        Termination::Exited(code) => format!("compiler exited with code {}", code),
        Termination::Signaled(sig) => format!("compiler killed by signal {}", sig),
        Termination::WallTimeout | Termination::CpuTimeout => {
            "compilation exceeded the time limit".to_string()
        }
        Termination::MemoryExceeded => "compilation exceeded the memory limit".to_string(),
        Termination::ProcessLimit => "compilation exceeded the process limit".to_string(),
        Termination::Cancelled => "compilation cancelled".to_string(),
    }
}

/// True when a run under an address-space cap died because an allocation was refused
fn allocation_failed(outcome: &ExecOutcome) -> bool {
    let died = match outcome.termination {
        Termination::Exited(code) => code != 0,
        Termination::Signaled(sig) => {
            sig == Signal::SIGABRT as i32 || sig == Signal::SIGSEGV as i32
        }
        _ => false,
    };
    died && {
        let stderr = outcome.stderr.as_lossy_str();
        ALLOCATION_FAILURES.iter().any(|marker| stderr.contains(marker))
    }
}

/// Map a raw outcome onto the result taxonomy.
///
/// `address_space_limited` says whether the run had an address-space rlimit, under
/// which an oversized allocation fails before resident memory ever grows.
fn interpret(
    outcome: ExecOutcome,
    limits: &ResourceLimits,
    address_space_limited: bool,
) -> ExecutionResult {
    let near_memory_limit = outcome
        .peak_memory_kb
        .map(|peak| peak as f64 >= limits.memory_kb() as f64 * MEMORY_CRASH_RATIO)
        .unwrap_or(false)
        || (address_space_limited && allocation_failed(&outcome));
    let sigkill = Some(Signal::SIGKILL as i32);

    let (status, exit_code, signal, message) = match outcome.termination {
        Termination::Exited(0) => (ResultStatus::Success, Some(0), None, None),
        Termination::Exited(code) if near_memory_limit => (
            ResultStatus::MemoryExceeded,
            Some(code),
            None,
            Some("memory limit exceeded"),
        ),
        Termination::Exited(code) => (ResultStatus::RuntimeError, Some(code), None, None),
        Termination::Signaled(sig) if near_memory_limit => (
            ResultStatus::MemoryExceeded,
            None,
            Some(sig),
            Some("memory limit exceeded"),
        ),
        Termination::Signaled(sig) => (ResultStatus::Crashed, None, Some(sig), None),
        Termination::WallTimeout => (
            ResultStatus::Timeout,
            None,
            sigkill,
            Some("wall time limit exceeded"),
        ),
        Termination::CpuTimeout => (
            ResultStatus::Timeout,
            None,
            Some(Signal::SIGXCPU as i32),
            Some("cpu time limit exceeded"),
        ),
        Termination::MemoryExceeded => (
            ResultStatus::MemoryExceeded,
            None,
            sigkill,
            Some("memory limit exceeded"),
        ),
        Termination::ProcessLimit => (
            ResultStatus::Crashed,
            None,
            sigkill,
            Some("process limit exceeded"),
        ),
        Termination::Cancelled => (ResultStatus::Timeout, None, sigkill, Some("cancelled")),
    };

    let mut result = ExecutionResult::with_streams(status, outcome.stdout, outcome.stderr);
    result.exit_code = exit_code;
    result.signal = signal;
    result.message = message.map(str::to_string);
    result.elapsed_ms = outcome.elapsed.as_millis() as u64;
    result.peak_memory_kb = outcome.peak_memory_kb;
    result
}

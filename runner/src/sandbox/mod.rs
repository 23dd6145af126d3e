//! Sandbox module - isolation backends and the shared execution path
//!
//! The core never assumes a specific isolation primitive. A backend must be able to:
//! - build a ready-to-run environment for a language (`build`)
//! - hand a private scratch directory to the sandbox identity (`prepare_scratch`)
//! - run a command inside that environment under a [`Limiter`] (`exec`)
//!
//! Two backends ship with the crate: jailed host processes and docker containers.

pub mod builder;
pub mod docker;
pub mod process;

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collector::{finish, CapturedStream, OutputChunk, OutputCollector, StreamKind};
use crate::languages::LanguageSpec;
use crate::limiter::{kill_pipe_holders, pipe_inode, Enforcer, Limiter, ProcessGroup, Termination};

pub use builder::SandboxBuilder;
pub use docker::DockerBackend;
pub use process::ProcessBackend;

/// How long collectors may keep reading after the process group is gone
const COLLECT_GRACE: Duration = Duration::from_millis(500);
/// Wait for output pipes to close before looking for escaped holders
const PIPE_SETTLE: Duration = Duration::from_millis(50);

/// What a backend produced for one language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxImage {
    /// Backend-specific reference (image tag, toolchain fingerprint, ...)
    pub reference: String,
    /// Minimal PATH inside the sandbox
    pub path: String,
}

/// Opaque, shared, read-only reference to a ready sandbox for one language
#[derive(Clone)]
pub struct SandboxHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    language: String,
    version: String,
    backend: &'static str,
    image: SandboxImage,
    built_at: SystemTime,
}

impl SandboxHandle {
    pub fn new(spec: &LanguageSpec, backend: &'static str, image: SandboxImage) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                language: spec.id.clone(),
                version: spec.version().to_string(),
                backend,
                image,
                built_at: SystemTime::now(),
            }),
        }
    }

    pub fn language(&self) -> &str {
        &self.inner.language
    }

    /// Version of the language spec this handle was built from
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn backend(&self) -> &'static str {
        self.inner.backend
    }

    pub fn reference(&self) -> &str {
        &self.inner.image.reference
    }

    pub fn path(&self) -> &str {
        &self.inner.image.path
    }

    pub fn built_at(&self) -> SystemTime {
        self.inner.built_at
    }

    /// True when both handles come from the same build
    pub fn same_build(&self, other: &SandboxHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("language", &self.inner.language)
            .field("backend", &self.inner.backend)
            .field("reference", &self.inner.image.reference)
            .finish()
    }
}

/// One command invocation inside a sandbox
pub struct ExecRequest<'a> {
    /// Session label, used for naming and logs
    pub label: &'a str,
    pub spec: &'a LanguageSpec,
    pub command: Vec<String>,
    /// Per-session scratch area; becomes the working directory
    pub workdir: &'a Path,
    /// Staged stdin file inside the scratch area
    pub stdin: Option<&'a Path>,
    pub limiter: &'a Limiter,
    pub max_output_bytes: usize,
    pub forward: Option<mpsc::Sender<OutputChunk>>,
    pub cancel: &'a CancellationToken,
}

/// Raw outcome of one invocation (no result interpretation)
#[derive(Debug)]
pub struct ExecOutcome {
    pub termination: Termination,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub elapsed: Duration,
    pub peak_memory_kb: Option<u64>,
}

/// An isolation primitive able to build language environments and run commands
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Construct the isolated environment for a language
    async fn build(&self, spec: &LanguageSpec) -> Result<SandboxImage>;

    /// Make a freshly staged scratch directory usable by the sandbox identity
    async fn prepare_scratch(&self, workdir: &Path) -> Result<()>;

    /// Run a command inside the sandbox, enforcing the request's limits
    async fn exec(&self, handle: &SandboxHandle, request: ExecRequest<'_>) -> Result<ExecOutcome>;
}

/// Spawn `cmd` with captured output and supervise it until it is gone.
///
/// `make_enforcer` receives the process group of the spawned command.
pub(crate) async fn drive<E, F>(
    mut cmd: Command,
    request: &ExecRequest<'_>,
    make_enforcer: F,
) -> Result<ExecOutcome>
where
    E: Enforcer,
    F: FnOnce(ProcessGroup) -> E,
{
    let stdin = match request.stdin {
        Some(path) => Stdio::from(
            std::fs::File::open(path)
                .with_context(|| format!("Failed to open staged stdin {:?}", path))?,
        ),
        None => Stdio::null(),
    };
    cmd.stdin(stdin).stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("[{}] Spawning {:?}", request.label, request.command);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {:?}", request.command))?;
    let group = ProcessGroup::of(&child)?;

    let stdout = child.stdout.take().context("stdout was not captured")?;
    let stderr = child.stderr.take().context("stderr was not captured")?;
    let pipes = match (pipe_inode(&stdout), pipe_inode(&stderr)) {
        (Ok(out), Ok(err)) => [out, err],
        (Err(e), _) | (_, Err(e)) => {
            group.kill();
            return Err(e);
        }
    };
    let mut stdout_task = OutputCollector::new(StreamKind::Stdout, request.max_output_bytes)
        .with_forward(request.forward.clone())
        .spawn(stdout);
    let mut stderr_task = OutputCollector::new(StreamKind::Stderr, request.max_output_bytes)
        .with_forward(request.forward.clone())
        .spawn(stderr);

    let enforcer = make_enforcer(group);
    let supervised = match request
        .limiter
        .supervise(&mut child, &enforcer, request.cancel)
        .await
    {
        Ok(supervised) => supervised,
        Err(e) => {
            enforcer.kill().await;
            return Err(e);
        }
    };

    // Output still open after the group is gone means something escaped it
    if !(stdout_task.wait_closed(PIPE_SETTLE).await && stderr_task.wait_closed(PIPE_SETTLE).await)
    {
        let killed = kill_pipe_holders(&pipes);
        if killed > 0 {
            warn!(
                "[{}] Killed {} escaped processes holding its output",
                request.label, killed
            );
        }
    }

    let stdout = finish(stdout_task, COLLECT_GRACE).await;
    let stderr = finish(stderr_task, COLLECT_GRACE).await;

    debug!(
        "[{}] Finished: {:?} in {}ms (stdout={}B, stderr={}B)",
        request.label,
        supervised.termination,
        supervised.elapsed.as_millis(),
        stdout.total_bytes,
        stderr.total_bytes
    );

    Ok(ExecOutcome {
        termination: supervised.termination,
        stdout,
        stderr,
        elapsed: supervised.elapsed,
        peak_memory_kb: supervised.peak_memory_kb,
    })
}

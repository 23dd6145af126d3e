//! Docker backend
//!
//! One image per language version, built from the language's image recipe and
//! cached under a tag derived from the spec digest. Each invocation is a fresh
//! `docker run` with no network, a read-only root, dropped capabilities, and
//! memory/pids/rlimit caps enforced by the container runtime.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use nix::unistd::geteuid;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process::{chown_tree, Identity};
use super::{drive, ExecOutcome, ExecRequest, SandboxBackend, SandboxHandle, SandboxImage};
use crate::languages::LanguageSpec;
use crate::limiter::{Enforcer, ProcessGroup, Termination, Usage};

/// Mount point of the scratch area inside containers
const CONTAINER_WORKDIR: &str = "/workspace";
/// Writable tmpfs inside containers, also used as HOME
const CONTAINER_HOME: &str = "/tmp";
const TMPFS_SIZE: &str = "64m";

/// `docker run` exit code when the daemon failed to start the container
const DOCKER_RUN_FAILED: i32 = 125;

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Containers run as the runner's own uid, or as 1000 when the runner is root
fn default_container_uid() -> u32 {
    let euid = geteuid();
    if euid.is_root() {
        1000
    } else {
        euid.as_raw()
    }
}

/// Backend running every command in a throwaway container
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: String,
    image_prefix: String,
    uid: u32,
}

impl DockerBackend {
    pub fn new(docker: impl Into<String>, image_prefix: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            image_prefix: image_prefix.into(),
            uid: default_container_uid(),
        }
    }

    /// Uid (and gid) commands run as inside containers
    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    pub fn image_tag(&self, spec: &LanguageSpec) -> String {
        format!("{}-{}:{}", self.image_prefix, spec.id, spec.short_version())
    }

    /// Dockerfile for a language's image recipe
    pub fn render_dockerfile(&self, spec: &LanguageSpec) -> Result<String> {
        let image = spec
            .image
            .as_ref()
            .with_context(|| format!("Language {} has no image recipe", spec.id))?;

        let mut lines = vec![format!("FROM {}", image.base)];
        if !image.packages.is_empty() {
            lines.push(format!("RUN apk add --no-cache {}", image.packages.join(" ")));
        }
        lines.push(format!(
            "RUN mkdir -p {0} && chmod 0777 {0}",
            CONTAINER_WORKDIR
        ));
        lines.push(format!("WORKDIR {}", CONTAINER_WORKDIR));
        lines.push(format!("ENV PATH={}", serde_json::to_string(&image.path)?));
        for (key, value) in &image.env {
            lines.push(format!("ENV {}={}", key, serde_json::to_string(value)?));
        }
        lines.push(format!("LABEL runner.language={}", spec.id));
        lines.push(format!("LABEL runner.version={}", spec.version()));

        Ok(lines.join("\n") + "\n")
    }

    fn container_name(&self, label: &str) -> String {
        let label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!(
            "{}-{}-{}",
            self.image_prefix,
            label,
            CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Arguments of `docker run` for one invocation
    fn run_args(&self, handle: &SandboxHandle, request: &ExecRequest<'_>, name: &str) -> Vec<String> {
        let limits = request.limiter.limits();
        let kernel = request.limiter.kernel_limits(false, false);
        let user = format!("{0}:{0}", self.uid);

        let mut args: Vec<String> = vec![
            "run".into(),
            "--name".into(),
            name.into(),
            "--network".into(),
            "none".into(),
            "--user".into(),
            user,
            "--memory".into(),
            format!("{}m", limits.memory_mb),
            "--memory-swap".into(),
            format!("{}m", limits.memory_mb),
            "--pids-limit".into(),
            limits.max_processes.to_string(),
            "--ulimit".into(),
            format!("cpu={}:{}", kernel.cpu_secs, kernel.cpu_secs + 1),
            "--ulimit".into(),
            format!("fsize={0}:{0}", kernel.file_size_bytes),
            "--ulimit".into(),
            "core=0:0".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--read-only".into(),
            "--tmpfs".into(),
            format!("{}:rw,exec,size={}", CONTAINER_HOME, TMPFS_SIZE),
            "-v".into(),
            format!("{}:{}", request.workdir.display(), CONTAINER_WORKDIR),
            "-w".into(),
            CONTAINER_WORKDIR.into(),
            "-e".into(),
            format!("HOME={}", CONTAINER_HOME),
            "-e".into(),
            format!("PATH={}", handle.path()),
        ];
        if request.stdin.is_some() {
            args.push("-i".into());
        }
        for (key, value) in request.spec.expanded_env(CONTAINER_HOME, CONTAINER_WORKDIR) {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        args.push(handle.reference().to_string());
        args.extend(request.command.iter().cloned());
        args
    }

    async fn image_exists(&self, tag: &str) -> bool {
        Command::new(&self.docker)
            .args(["image", "inspect", tag])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn oom_killed(&self, name: &str) -> bool {
        let output = Command::new(&self.docker)
            .args(["inspect", "-f", "{{.State.OOMKilled}}", name])
            .stderr(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim() == "true",
            _ => false,
        }
    }

    async fn remove(&self, name: &str) {
        let status = Command::new(&self.docker)
            .args(["rm", "-f", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if !matches!(status, Ok(s) if s.success()) {
            warn!("Failed to remove container {}", name);
        }
    }
}

/// Container exit codes above 128 mean "killed by signal (code - 128)"
fn decode_exit(termination: Termination) -> Termination {
    match termination {
        Termination::Exited(code) if code > 128 && code < 128 + 65 => {
            let signal = code - 128;
            if signal == Signal::SIGXCPU as i32 {
                Termination::CpuTimeout
            } else {
                Termination::Signaled(signal)
            }
        }
        other => other,
    }
}

/// Stops both the container and the local `docker run` client
struct ContainerGuard {
    docker: String,
    name: String,
    client: ProcessGroup,
}

#[async_trait]
impl Enforcer for ContainerGuard {
    async fn kill(&self) {
        let _ = Command::new(&self.docker)
            .args(["kill", &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        self.client.kill();
    }

    // Memory and pids are enforced by the container runtime
    fn sample(&self) -> Option<Usage> {
        None
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(&self, spec: &LanguageSpec) -> Result<SandboxImage> {
        let tag = self.image_tag(spec);
        let dockerfile = self.render_dockerfile(spec)?;
        let path = spec
            .image
            .as_ref()
            .map(|image| image.path.clone())
            .unwrap_or_default();

        if self.image_exists(&tag).await {
            info!("Reusing cached image {} for {}", tag, spec.id);
            return Ok(SandboxImage { reference: tag, path });
        }

        info!("Building image {} for {}", tag, spec.id);
        let mut child = Command::new(&self.docker)
            .args(["build", "--progress=plain", "-t", &tag, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to execute docker build command")?;

        let mut stdin = child.stdin.take().context("docker build stdin not captured")?;
        stdin.write_all(dockerfile.as_bytes()).await?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for docker build")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            anyhow::bail!(
                "Docker build failed for {}: {}",
                spec.id,
                tail.into_iter().rev().collect::<Vec<_>>().join("\n")
            );
        }

        Ok(SandboxImage { reference: tag, path })
    }

    async fn prepare_scratch(&self, workdir: &Path) -> Result<()> {
        tokio::fs::set_permissions(workdir, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to restrict scratch permissions")?;

        // Only the container uid may touch the scratch area
        if geteuid().as_raw() != self.uid {
            let root = workdir.to_path_buf();
            let identity = Identity {
                uid: self.uid,
                gid: self.uid,
            };
            tokio::task::spawn_blocking(move || chown_tree(&root, identity))
                .await
                .context("Scratch ownership task failed")??;
        }
        Ok(())
    }

    async fn exec(&self, handle: &SandboxHandle, request: ExecRequest<'_>) -> Result<ExecOutcome> {
        let name = self.container_name(request.label);
        let args = self.run_args(handle, &request, &name);
        debug!("[{}] docker {}", request.label, args.join(" "));

        let mut cmd = Command::new(&self.docker);
        cmd.args(&args).process_group(0).kill_on_drop(true);

        let docker = self.docker.clone();
        let guard_name = name.clone();
        let outcome = drive(cmd, &request, move |client| ContainerGuard {
            docker,
            name: guard_name,
            client,
        })
        .await;

        let oom = outcome.is_ok() && self.oom_killed(&name).await;
        self.remove(&name).await;

        let mut outcome = outcome?;
        if outcome.termination == Termination::Exited(DOCKER_RUN_FAILED) {
            anyhow::bail!(
                "docker run failed for {}: {}",
                handle.reference(),
                outcome.stderr.as_lossy_str().trim()
            );
        }
        outcome.termination = if oom {
            Termination::MemoryExceeded
        } else {
            decode_exit(outcome.termination)
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageRegistry;
    use crate::limiter::{Limiter, ResourceLimits};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn backend() -> DockerBackend {
        DockerBackend::new("docker", "runner").with_uid(1000)
    }

    #[test]
    fn test_render_dockerfile() {
        let registry = LanguageRegistry::builtin().unwrap();
        let cpp = registry.resolve("cpp").unwrap();

        let dockerfile = backend().render_dockerfile(&cpp).unwrap();
        let lines: Vec<&str> = dockerfile.lines().collect();

        assert_eq!(lines[0], format!("FROM {}", cpp.image.as_ref().unwrap().base));
        assert!(lines[1].starts_with("RUN apk add --no-cache"));
        assert!(dockerfile.contains("WORKDIR /workspace\n"));
        assert!(dockerfile.contains(&format!("LABEL runner.version={}", cpp.version())));
    }

    #[test]
    fn test_dockerfile_requires_recipe() {
        let registry = LanguageRegistry::from_toml_str(
            r#"
[sh]
extension = "sh"
run_command = "sh {source}"
"#,
        )
        .unwrap();
        let sh = registry.resolve("sh").unwrap();
        assert!(backend().render_dockerfile(&sh).is_err());
    }

    #[test]
    fn test_image_tag_tracks_version() {
        let registry = LanguageRegistry::builtin().unwrap();
        let go = registry.resolve("go").unwrap();
        assert_eq!(
            backend().image_tag(&go),
            format!("runner-go:{}", go.short_version())
        );
    }

    #[test]
    fn test_run_args() {
        let registry = LanguageRegistry::builtin().unwrap();
        let python = registry.resolve("python").unwrap();
        let backend = backend();
        let image = SandboxImage {
            reference: backend.image_tag(&python),
            path: "/usr/bin:/bin".to_string(),
        };
        let handle = SandboxHandle::new(&python, "docker", image);

        let limiter = Limiter::new(
            ResourceLimits {
                memory_mb: 128,
                max_processes: 8,
                cpu_time_ms: 1500,
                ..ResourceLimits::default()
            },
            Duration::from_millis(50),
        );
        let cancel = CancellationToken::new();
        let stdin = Path::new("/scratch/python-1/.stdin");
        let request = ExecRequest {
            label: "python-1",
            spec: &python,
            command: python.expanded_run_command(),
            workdir: Path::new("/scratch/python-1"),
            stdin: Some(stdin),
            limiter: &limiter,
            max_output_bytes: 1024,
            forward: None,
            cancel: &cancel,
        };

        let args = backend.run_args(&handle, &request, "runner-python-1-0");
        let joined = args.join(" ");

        assert!(joined.contains("--network none"));
        assert!(joined.contains("--user 1000:1000"));
        assert!(joined.contains("--memory 128m --memory-swap 128m"));
        assert!(joined.contains("--pids-limit 8"));
        assert!(joined.contains("--ulimit cpu=2:3"));
        assert!(joined.contains("-v /scratch/python-1:/workspace"));
        assert!(args.contains(&"-i".to_string()));
        assert!(joined.ends_with(&format!("{} python3 main.py", handle.reference())));
    }

    #[test]
    fn test_decode_exit() {
        assert_eq!(decode_exit(Termination::Exited(0)), Termination::Exited(0));
        assert_eq!(decode_exit(Termination::Exited(139)), Termination::Signaled(11));
        assert_eq!(decode_exit(Termination::Exited(152)), Termination::CpuTimeout);
        assert_eq!(
            decode_exit(Termination::WallTimeout),
            Termination::WallTimeout
        );
    }

    #[test]
    fn test_container_names_are_unique() {
        let backend = backend();
        let a = backend.container_name("cpp 1");
        let b = backend.container_name("cpp 1");
        assert_ne!(a, b);
        assert!(a.starts_with("runner-cpp_1-"));
    }

    #[tokio::test]
    async fn test_scratch_is_private_to_container_uid() {
        let scratch = tempfile::tempdir().unwrap();
        let backend = DockerBackend::new("docker", "runner").with_uid(geteuid().as_raw());

        backend.prepare_scratch(scratch.path()).await.unwrap();

        let mode = std::fs::metadata(scratch.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_default_container_uid() {
        let uid = DockerBackend::new("docker", "runner").uid;
        if geteuid().is_root() {
            assert_eq!(uid, 1000);
        } else {
            assert_eq!(uid, geteuid().as_raw());
        }
    }
}

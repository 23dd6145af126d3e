//! Process backend
//!
//! Runs commands as jailed host processes: a private process group, kernel rlimits,
//! a cleared environment with a minimal `PATH` and a `HOME` inside the scratch area,
//! and, when the runner is privileged, a dedicated non-root uid/gid.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::unistd::{chown, geteuid, Gid, Uid};
use tokio::process::Command;
use tracing::{debug, info};

use super::{drive, ExecOutcome, ExecRequest, SandboxBackend, SandboxHandle, SandboxImage};
use crate::languages::{LanguageSpec, DEFAULT_SANDBOX_PATH};

/// Directory inside the scratch area used as `HOME`
const HOME_DIR: &str = ".home";

/// Non-privileged execution identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// Backend running commands as restricted host processes
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    path: String,
    identity: Option<Identity>,
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self {
            path: DEFAULT_SANDBOX_PATH.to_string(),
            identity: None,
        }
    }
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// PATH visible to sandboxed commands
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Run every command as `uid:gid`; requires the runner to be root
    pub fn with_identity(mut self, uid: u32, gid: u32) -> Result<Self> {
        if !geteuid().is_root() {
            anyhow::bail!(
                "Running sandboxed commands as uid {} requires the runner to be root",
                uid
            );
        }
        if uid == 0 {
            anyhow::bail!("Sandbox identity must not be root");
        }
        self.identity = Some(Identity { uid, gid });
        Ok(self)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }
}

/// Find `program` in a colon-separated PATH, like execvp would
fn resolve_program(program: &str, path: &str) -> Option<PathBuf> {
    path.split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| {
            candidate
                .metadata()
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

pub(super) fn chown_tree(root: &Path, identity: Identity) -> Result<()> {
    let uid = Some(Uid::from_raw(identity.uid));
    let gid = Some(Gid::from_raw(identity.gid));

    let mut pending = vec![root.to_path_buf()];
    while let Some(path) = pending.pop() {
        chown(path.as_path(), uid, gid).with_context(|| format!("Failed to chown {:?}", path))?;
        if path.is_dir() && !path.is_symlink() {
            for entry in std::fs::read_dir(&path)? {
                pending.push(entry?.path());
            }
        }
    }
    Ok(())
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn build(&self, spec: &LanguageSpec) -> Result<SandboxImage> {
        // Programs produced by the build step (./main) only exist per session
        for program in spec.programs().into_iter().filter(|p| !p.contains('/')) {
            let resolved = resolve_program(program, &self.path).with_context(|| {
                format!("'{}' not found on sandbox PATH {}", program, self.path)
            })?;
            debug!("Resolved {} for {} to {:?}", program, spec.id, resolved);
        }

        info!(
            "Process sandbox ready for {} (identity: {:?})",
            spec.id, self.identity
        );

        Ok(SandboxImage {
            reference: format!("process:{}@{}", spec.id, spec.short_version()),
            path: self.path.clone(),
        })
    }

    async fn prepare_scratch(&self, workdir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(workdir.join(HOME_DIR))
            .await
            .context("Failed to create sandbox HOME")?;
        tokio::fs::set_permissions(workdir, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to restrict scratch permissions")?;

        if let Some(identity) = self.identity {
            let root = workdir.to_path_buf();
            tokio::task::spawn_blocking(move || chown_tree(&root, identity))
                .await
                .context("Scratch ownership task failed")??;
        }
        Ok(())
    }

    async fn exec(&self, handle: &SandboxHandle, request: ExecRequest<'_>) -> Result<ExecOutcome> {
        let (program, args) = request
            .command
            .split_first()
            .context("Empty command for sandboxed execution")?;

        let home = request.workdir.join(HOME_DIR);
        let home_str = home.to_string_lossy().into_owned();
        let workdir_str = request.workdir.to_string_lossy().into_owned();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(request.workdir)
            .env_clear()
            .env("PATH", handle.path())
            .env("HOME", &home)
            .envs(request.spec.expanded_env(&home_str, &workdir_str));

        if let Some(identity) = self.identity {
            cmd.uid(identity.uid).gid(identity.gid);
        }

        request.limiter.prepare(
            &mut cmd,
            request.spec.limit_address_space,
            self.identity.is_some(),
        );

        drive(cmd, &request, |group| group).await
    }
}

//! Resource limiter
//!
//! Wraps a spawned command with the mandatory limits of a session:
//! - wall-clock timeout (the whole process group is killed on expiry)
//! - memory ceiling and process-count cap (sampled from `/proc`, enforced by kill)
//! - CPU time and file size ceilings (kernel rlimits applied before exec)
//!
//! Limits can only be tightened by callers, never disabled.

use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::stat::fstat;
use nix::unistd::{sysconf, Pid, SysconfVar};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Rejection;

/// Virtual memory allowed on top of the memory limit (libraries, stacks, arenas)
pub const ADDRESS_SPACE_HEADROOM_MB: u64 = 64;

/// Resource limits for one command invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock limit in milliseconds
    pub wall_time_ms: u64,
    /// CPU time limit in milliseconds
    pub cpu_time_ms: u64,
    /// Memory limit in MB
    pub memory_mb: u64,
    /// Maximum number of live processes in the group
    pub max_processes: u64,
    /// Maximum size of any written file in KB
    pub max_file_size_kb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_time_ms: 5_000,
            cpu_time_ms: 2_000,
            memory_mb: 256,
            max_processes: 32,
            max_file_size_kb: 65_536, // 64MB
        }
    }
}

impl ResourceLimits {
    /// Limits used for compilation steps unless a language provides its own
    pub fn build_default() -> Self {
        Self {
            wall_time_ms: 30_000,
            cpu_time_ms: 30_000,
            memory_mb: 2048,
            max_processes: 128,
            max_file_size_kb: 262_144, // 256MB
        }
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_time_ms)
    }

    pub fn memory_kb(&self) -> u64 {
        self.memory_mb * 1024
    }

    /// Field-wise minimum of `self` and `max`
    pub fn clamp_to(&self, max: &ResourceLimits) -> Self {
        Self {
            wall_time_ms: self.wall_time_ms.min(max.wall_time_ms),
            cpu_time_ms: self.cpu_time_ms.min(max.cpu_time_ms),
            memory_mb: self.memory_mb.min(max.memory_mb),
            max_processes: self.max_processes.min(max.max_processes),
            max_file_size_kb: self.max_file_size_kb.min(max.max_file_size_kb),
        }
    }

    /// True when every field is at most the corresponding field of `max`
    pub fn fits_within(&self, max: &ResourceLimits) -> bool {
        self.clamp_to(max) == *self
    }

    /// Apply caller overrides on top of these defaults, capped by `max`.
    ///
    /// A zero override would disable a limit and is rejected.
    pub fn with_overrides(
        &self,
        overrides: &LimitOverrides,
        max: &ResourceLimits,
    ) -> Result<Self, Rejection> {
        let pick = |name: &str, value: Option<u64>, default: u64| match value {
            Some(0) => Err(Rejection::InvalidInput(format!(
                "limit {} must be greater than zero",
                name
            ))),
            Some(v) => Ok(v),
            None => Ok(default),
        };

        let requested = Self {
            wall_time_ms: pick("wall_time_ms", overrides.wall_time_ms, self.wall_time_ms)?,
            cpu_time_ms: pick("cpu_time_ms", overrides.cpu_time_ms, self.cpu_time_ms)?,
            memory_mb: pick("memory_mb", overrides.memory_mb, self.memory_mb)?,
            max_processes: pick("max_processes", overrides.max_processes, self.max_processes)?,
            max_file_size_kb: pick(
                "max_file_size_kb",
                overrides.max_file_size_kb,
                self.max_file_size_kb,
            )?,
        };

        Ok(requested.clamp_to(max))
    }
}

/// Caller-supplied limit adjustments (all optional)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size_kb: Option<u64>,
}

impl LimitOverrides {
    pub fn with_wall_time_ms(mut self, ms: u64) -> Self {
        self.wall_time_ms = Some(ms);
        self
    }

    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = Some(mb);
        self
    }
}

/// How a supervised invocation ended (raw, no result interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited normally with the given code
    Exited(i32),
    /// Killed by a signal we did not send
    Signaled(i32),
    /// Wall-clock limit reached, group killed
    WallTimeout,
    /// CPU rlimit reached (SIGXCPU)
    CpuTimeout,
    /// Memory ceiling breached, group killed
    MemoryExceeded,
    /// Too many processes in the group, group killed
    ProcessLimit,
    /// Cancelled by the caller, group killed
    Cancelled,
}

impl Termination {
    pub fn is_success(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }

    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Termination::Exited(code);
        }
        match status.signal() {
            Some(sig) if sig == Signal::SIGXCPU as i32 => Termination::CpuTimeout,
            Some(sig) => Termination::Signaled(sig),
            None => Termination::Exited(-1),
        }
    }
}

/// Point-in-time resource usage of an invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub memory_kb: u64,
    pub processes: u64,
}

/// Result of supervising one invocation
#[derive(Debug, Clone, Copy)]
pub struct Supervised {
    pub termination: Termination,
    pub elapsed: Duration,
    pub peak_memory_kb: Option<u64>,
}

/// Backend hook used by the limiter to observe and stop an invocation
#[async_trait]
pub trait Enforcer: Send + Sync {
    /// Forcibly stop everything started for the invocation
    async fn kill(&self);

    /// Current usage, or None when the backend enforces memory itself
    fn sample(&self) -> Option<Usage>;
}

/// A process group created for one invocation
#[derive(Debug, Clone, Copy)]
pub struct ProcessGroup {
    pgid: i32,
}

impl ProcessGroup {
    /// Process group led by the spawned child (spawned with `process_group(0)`)
    pub fn of(child: &Child) -> Result<Self> {
        let pid = child
            .id()
            .context("Spawned process has no pid (already reaped)")?;
        Ok(Self { pgid: pid as i32 })
    }

    pub fn id(&self) -> i32 {
        self.pgid
    }

    /// SIGKILL every member of the group. A missing group is not an error.
    pub fn kill(&self) {
        match killpg(Pid::from_raw(self.pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", self.pgid, e),
        }
    }

    /// True while any live (non-zombie) process still belongs to the group
    pub fn is_alive(&self) -> bool {
        self.usage().processes > 0
    }

    /// Sum of resident memory and count of live processes in the group
    pub fn usage(&self) -> Usage {
        let page_kb = page_size_kb();
        let mut usage = Usage::default();

        let Ok(entries) = fs::read_dir("/proc") else {
            return usage;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
                continue;
            };
            let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
                continue;
            };
            if let Some(stat) = parse_stat(&stat) {
                if stat.pgrp == self.pgid && stat.state != 'Z' {
                    usage.processes += 1;
                    usage.memory_kb += stat.rss_pages * page_kb;
                }
            }
        }

        usage
    }
}

#[async_trait]
impl Enforcer for ProcessGroup {
    async fn kill(&self) {
        ProcessGroup::kill(self);
    }

    fn sample(&self) -> Option<Usage> {
        Some(self.usage())
    }
}

/// Inode of the pipe behind `fd`, as shown in `/proc/<pid>/fd` links
pub fn pipe_inode(fd: &impl AsRawFd) -> Result<u64> {
    let stat = fstat(fd.as_raw_fd()).context("Failed to stat output pipe")?;
    Ok(stat.st_ino as u64)
}

/// SIGKILL every other process holding one of the given pipes.
///
/// Catches descendants that left the process group (`setsid`) but still hold
/// an output pipe. Returns how many were killed.
pub fn kill_pipe_holders(inodes: &[u64]) -> usize {
    let links: Vec<String> = inodes.iter().map(|ino| format!("pipe:[{}]", ino)).collect();
    let own = std::process::id().to_string();
    let mut killed = 0;

    let Ok(entries) = fs::read_dir("/proc") else {
        return 0;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };
        if pid == own {
            continue;
        }
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let holds_pipe = fds.flatten().any(|fd| {
            fs::read_link(fd.path())
                .map(|target| links.iter().any(|link| target.as_os_str() == link.as_str()))
                .unwrap_or(false)
        });
        if !holds_pipe {
            continue;
        }
        let Ok(raw) = pid.parse::<i32>() else {
            continue;
        };
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => killed += 1,
            Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill escaped process {}: {}", pid, e),
        }
    }

    killed
}

#[derive(Debug, PartialEq, Eq)]
struct ProcStat {
    state: char,
    pgrp: i32,
    rss_pages: u64,
}

/// Parse the fields we need from a `/proc/<pid>/stat` line
fn parse_stat(stat: &str) -> Option<ProcStat> {
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state) of proc(5)
    Some(ProcStat {
        state: fields.first()?.chars().next()?,
        pgrp: fields.get(2)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

fn page_size_kb() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64 / 1024,
        _ => 4,
    }
}

/// Kernel-side limits applied in the child before exec
#[derive(Debug, Clone, Copy)]
pub struct KernelLimits {
    pub cpu_secs: u64,
    pub address_space_bytes: Option<u64>,
    pub processes: Option<u64>,
    pub file_size_bytes: u64,
}

/// Enforces one set of [`ResourceLimits`] around a spawned command
#[derive(Debug, Clone)]
pub struct Limiter {
    limits: ResourceLimits,
    sample_interval: Duration,
}

impl Limiter {
    pub fn new(limits: ResourceLimits, sample_interval: Duration) -> Self {
        Self {
            limits,
            sample_interval,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// rlimits matching these limits.
    ///
    /// The address-space cap is only set for runtimes that do not reserve huge
    /// virtual ranges up front. It sits [`ADDRESS_SPACE_HEADROOM_MB`] above the
    /// memory limit so gradual growth is caught by the resident-memory sampler. RLIMIT_NPROC counts per uid, so it is only
    /// meaningful when commands run under a dedicated identity.
    pub fn kernel_limits(&self, limit_address_space: bool, dedicated_uid: bool) -> KernelLimits {
        KernelLimits {
            cpu_secs: self.limits.cpu_time_ms.div_ceil(1000).max(1),
            address_space_bytes: limit_address_space
                .then(|| (self.limits.memory_mb + ADDRESS_SPACE_HEADROOM_MB) * 1024 * 1024),
            processes: dedicated_uid.then_some(self.limits.max_processes),
            file_size_bytes: self.limits.max_file_size_kb * 1024,
        }
    }

    /// Put the command in its own process group and install rlimits
    pub fn prepare(&self, cmd: &mut Command, limit_address_space: bool, dedicated_uid: bool) {
        let kernel = self.kernel_limits(limit_address_space, dedicated_uid);
        cmd.process_group(0).kill_on_drop(true);

        // SAFETY: only async-signal-safe setrlimit calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                apply_kernel_limits(&kernel).map_err(std::io::Error::from)
            });
        }
    }

    /// Wait for `child` while enforcing the limits.
    ///
    /// The group is always killed before returning so nothing outlives the call.
    pub async fn supervise(
        &self,
        child: &mut Child,
        enforcer: &dyn Enforcer,
        cancel: &CancellationToken,
    ) -> Result<Supervised> {
        let start = Instant::now();
        let deadline = sleep(self.limits.wall_time());
        tokio::pin!(deadline);

        let mut ticker = interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let memory_limit_kb = self.limits.memory_kb();
        let mut peak_memory_kb: Option<u64> = None;

        let breach = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.context("Failed to wait for sandboxed process")?;
                    let elapsed = start.elapsed();
                    // Sweep stragglers left in the group by the exited leader
                    enforcer.kill().await;
                    return Ok(Supervised {
                        termination: Termination::from_status(status),
                        elapsed,
                        peak_memory_kb,
                    });
                }
                _ = &mut deadline => break Termination::WallTimeout,
                _ = cancel.cancelled() => break Termination::Cancelled,
                _ = ticker.tick() => {
                    if let Some(usage) = enforcer.sample() {
                        peak_memory_kb = Some(peak_memory_kb.unwrap_or(0).max(usage.memory_kb));
                        if usage.memory_kb > memory_limit_kb {
                            break Termination::MemoryExceeded;
                        }
                        if usage.processes > self.limits.max_processes {
                            break Termination::ProcessLimit;
                        }
                    }
                }
            }
        };

        debug!("Limit breached ({:?}), killing invocation", breach);
        enforcer.kill().await;
        if let Err(e) = child.wait().await {
            warn!("Failed to reap killed process: {}", e);
        }

        Ok(Supervised {
            termination: breach,
            elapsed: start.elapsed(),
            peak_memory_kb,
        })
    }
}

fn apply_kernel_limits(kernel: &KernelLimits) -> nix::Result<()> {
    setrlimit(Resource::RLIMIT_CPU, kernel.cpu_secs, kernel.cpu_secs + 1)?;
    setrlimit(
        Resource::RLIMIT_FSIZE,
        kernel.file_size_bytes,
        kernel.file_size_bytes,
    )?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    if let Some(bytes) = kernel.address_space_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if let Some(processes) = kernel.processes {
        setrlimit(Resource::RLIMIT_NPROC, processes, processes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn limiter(limits: ResourceLimits) -> Limiter {
        Limiter::new(limits, Duration::from_millis(20))
    }

    fn spawn_sh(limiter: &Limiter, script: &str) -> Child {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        limiter.prepare(&mut cmd, false, false);
        cmd.spawn().unwrap()
    }

    #[test]
    fn test_overrides_only_tighten() {
        let defaults = ResourceLimits::default();
        let max = ResourceLimits {
            wall_time_ms: 10_000,
            ..ResourceLimits::default()
        };

        let overrides = LimitOverrides::default()
            .with_wall_time_ms(60_000)
            .with_memory_mb(64);
        let limits = defaults.with_overrides(&overrides, &max).unwrap();

        assert_eq!(limits.wall_time_ms, 10_000);
        assert_eq!(limits.memory_mb, 64);
        assert_eq!(limits.cpu_time_ms, defaults.cpu_time_ms);
        assert!(limits.fits_within(&max));
    }

    #[test]
    fn test_zero_override_rejected() {
        let defaults = ResourceLimits::default();
        let overrides = LimitOverrides {
            cpu_time_ms: Some(0),
            ..LimitOverrides::default()
        };
        let err = defaults.with_overrides(&overrides, &defaults).unwrap_err();
        assert!(matches!(err, Rejection::InvalidInput(_)));
    }

    #[test]
    fn test_kernel_limits() {
        let limiter = limiter(ResourceLimits {
            cpu_time_ms: 1500,
            memory_mb: 128,
            ..ResourceLimits::default()
        });

        let kernel = limiter.kernel_limits(true, false);
        assert_eq!(kernel.cpu_secs, 2);
        assert_eq!(kernel.address_space_bytes, Some(192 * 1024 * 1024));
        assert_eq!(kernel.processes, None);

        let kernel = limiter.kernel_limits(false, true);
        assert_eq!(kernel.address_space_bytes, None);
        assert_eq!(kernel.processes, Some(32));
    }

    #[test]
    fn test_parse_stat() {
        let stat = "1234 (a b) c) S 1 1234 1234 0 -1 4194560 100 0 0 0 0 0 0 0 20 0 1 0 100 1000000 250 18446744073709551615";
        assert_eq!(
            parse_stat(stat),
            Some(ProcStat {
                state: 'S',
                pgrp: 1234,
                rss_pages: 250,
            })
        );
        assert_eq!(parse_stat("garbage"), None);
    }

    #[tokio::test]
    async fn test_supervise_normal_exit() {
        let limiter = limiter(ResourceLimits::default());
        let mut child = spawn_sh(&limiter, "exit 3");
        let group = ProcessGroup::of(&child).unwrap();

        let supervised = limiter
            .supervise(&mut child, &group, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(supervised.termination, Termination::Exited(3));
    }

    #[tokio::test]
    async fn test_wall_timeout_kills_whole_group() {
        let limiter = limiter(ResourceLimits {
            wall_time_ms: 300,
            ..ResourceLimits::default()
        });
        // Background child keeps the group alive after the leader would block
        let mut child = spawn_sh(&limiter, "sleep 30 & sleep 30; wait");
        let group = ProcessGroup::of(&child).unwrap();

        let supervised = limiter
            .supervise(&mut child, &group, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(supervised.termination, Termination::WallTimeout);
        assert!(supervised.elapsed < Duration::from_secs(5));

        // Reparented members are reaped asynchronously
        for _ in 0..50 {
            if !group.is_alive() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(!group.is_alive());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let limiter = limiter(ResourceLimits::default());
        let mut child = spawn_sh(&limiter, "sleep 30");
        let group = ProcessGroup::of(&child).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let supervised = limiter.supervise(&mut child, &group, &cancel).await.unwrap();
        assert_eq!(supervised.termination, Termination::Cancelled);
    }

    #[tokio::test]
    async fn test_process_limit() {
        let limiter = limiter(ResourceLimits {
            max_processes: 2,
            ..ResourceLimits::default()
        });
        let mut child = spawn_sh(
            &limiter,
            "sleep 30 & sleep 30 & sleep 30 & sleep 30 & wait",
        );
        let group = ProcessGroup::of(&child).unwrap();

        let supervised = limiter
            .supervise(&mut child, &group, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(supervised.termination, Termination::ProcessLimit);
    }

    #[tokio::test]
    async fn test_kill_pipe_holders() {
        // Not in a process group of ours, only reachable through its pipe
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let inode = pipe_inode(&stdout).unwrap();

        assert!(kill_pipe_holders(&[inode]) >= 1);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }
}

//! Runner configuration
//!
//! Loaded from the environment (after `.env`), with defaults suitable for a
//! single host. Every variable is optional.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::orchestrator::OrchestratorConfig;
use crate::session::SessionSettings;

/// Which isolation primitive runs submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Process,
    Docker,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "process" => Ok(BackendKind::Process),
            "docker" => Ok(BackendKind::Docker),
            other => anyhow::bail!("Unknown sandbox backend: {}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub backend: BackendKind,
    pub orchestrator: OrchestratorConfig,
    /// Dedicated uid/gid for the process backend
    pub sandbox_uid: Option<u32>,
    pub sandbox_gid: Option<u32>,
    pub docker_binary: String,
    pub image_prefix: String,
    /// Language table; the embedded one is used when unset
    pub languages_config: Option<PathBuf>,
    pub redis_url: String,
    /// Build every language's sandbox at startup instead of on first use
    pub prebuild: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Process,
            orchestrator: OrchestratorConfig::default(),
            sandbox_uid: None,
            sandbox_gid: None,
            docker_binary: "docker".to_string(),
            image_prefix: "runner".to_string(),
            languages_config: None,
            redis_url: "redis://localhost:6379".to_string(),
            prebuild: false,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let defaults = OrchestratorConfig::default();
        let session_defaults = SessionSettings::default();

        if let Some(backend) = lookup("RUNNER_BACKEND") {
            config.backend = backend.parse()?;
        }

        config.orchestrator = OrchestratorConfig {
            workers: parse_or(&lookup, "RUNNER_WORKERS", defaults.workers)?,
            queue_capacity: parse_or(&lookup, "RUNNER_QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_source_bytes: parse_or(&lookup, "RUNNER_MAX_SOURCE_BYTES", defaults.max_source_bytes)?,
            max_stdin_bytes: parse_or(&lookup, "RUNNER_MAX_STDIN_BYTES", defaults.max_stdin_bytes)?,
            session: SessionSettings {
                scratch_root: lookup("RUNNER_SCRATCH_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(session_defaults.scratch_root),
                max_output_bytes: parse_or(
                    &lookup,
                    "RUNNER_MAX_OUTPUT_BYTES",
                    session_defaults.max_output_bytes,
                )?,
                sample_interval: Duration::from_millis(parse_or(
                    &lookup,
                    "RUNNER_SAMPLE_INTERVAL_MS",
                    session_defaults.sample_interval.as_millis() as u64,
                )?),
            },
        };

        if config.orchestrator.workers == 0 {
            anyhow::bail!("RUNNER_WORKERS must be at least 1");
        }
        if config.orchestrator.session.sample_interval.is_zero() {
            anyhow::bail!("RUNNER_SAMPLE_INTERVAL_MS must be greater than zero");
        }

        config.sandbox_uid = parse_opt(&lookup, "RUNNER_SANDBOX_UID")?;
        config.sandbox_gid = parse_opt(&lookup, "RUNNER_SANDBOX_GID")?;
        if let Some(docker) = lookup("RUNNER_DOCKER_BINARY") {
            config.docker_binary = docker;
        }
        if let Some(prefix) = lookup("RUNNER_IMAGE_PREFIX") {
            config.image_prefix = prefix;
        }
        config.languages_config = lookup("LANGUAGES_CONFIG").map(PathBuf::from);
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        config.prebuild = parse_or(&lookup, "RUNNER_PREBUILD", false)?;

        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn parse_opt<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", key, value))
        })
        .transpose()
}

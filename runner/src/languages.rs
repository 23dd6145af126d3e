//! Language registry
//!
//! Static mapping from language identifier to the executor description used to
//! build and run submitted code. New languages are added by data (TOML), not code.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Rejection;
use crate::limiter::{LimitOverrides, ResourceLimits};

/// Embedded default language table
const BUILTIN_LANGUAGES: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Minimal PATH handed to sandboxed commands
pub const DEFAULT_SANDBOX_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Recipe for container images of a language
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Base image carrying the toolchain
    pub base: String,
    /// Extra packages installed on top of the base
    #[serde(default)]
    pub packages: Vec<String>,
    /// PATH inside the image
    #[serde(default = "default_path")]
    pub path: String,
    /// Image-level environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_path() -> String {
    DEFAULT_SANDBOX_PATH.to_string()
}

/// Static description of how to build and run code for one language
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageSpec {
    pub id: String,
    pub aliases: Vec<String>,
    pub extension: String,
    /// Name of the staged source file (e.g., "main.cpp")
    pub source_file: String,
    /// Build command (None for interpreted languages)
    pub build_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    /// Extra environment; `{home}` and `{workdir}` expand per session
    pub env: BTreeMap<String, String>,
    pub default_limits: ResourceLimits,
    /// Administrative maxima for caller overrides
    pub max_limits: ResourceLimits,
    pub build_limits: Option<ResourceLimits>,
    /// Whether memory_mb is also applied as an address-space rlimit
    pub limit_address_space: bool,
    pub image: Option<ImageSpec>,
    #[serde(skip)]
    version: String,
}

impl LanguageSpec {
    /// Content digest of this spec; changes whenever any field changes
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Short form of the version, suitable for tags and logs
    pub fn short_version(&self) -> &str {
        &self.version[..self.version.len().min(12)]
    }

    pub fn is_compiled(&self) -> bool {
        self.build_command.is_some()
    }

    /// Effective run limits for a caller's overrides
    pub fn run_limits(&self, overrides: &LimitOverrides) -> Result<ResourceLimits, Rejection> {
        self.default_limits.with_overrides(overrides, &self.max_limits)
    }

    pub fn expanded_build_command(&self) -> Option<Vec<String>> {
        self.build_command
            .as_ref()
            .map(|cmd| expand_command(cmd, &self.source_file))
    }

    pub fn expanded_run_command(&self) -> Vec<String> {
        expand_command(&self.run_command, &self.source_file)
    }

    /// Language environment with session placeholders filled in
    pub fn expanded_env(&self, home: &str, workdir: &str) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| {
                let value = v.replace("{home}", home).replace("{workdir}", workdir);
                (k.clone(), value)
            })
            .collect()
    }

    /// Every program named as the first word of a build or run command
    pub fn programs(&self) -> Vec<&str> {
        self.build_command
            .iter()
            .chain(std::iter::once(&self.run_command))
            .filter_map(|cmd| cmd.first().map(String::as_str))
            .collect()
    }

    fn seal(mut self) -> Result<Self> {
        let canonical = serde_json::to_vec(&self).context("Failed to serialize language spec")?;
        let digest = Sha256::digest(&canonical);
        self.version = format!("{:x}", digest);
        Ok(self)
    }
}

fn expand_command(command: &[String], source: &str) -> Vec<String> {
    command
        .iter()
        .map(|arg| arg.replace("{source}", source))
        .collect()
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

/// Limits as written in TOML; missing fields fall back to a base
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimits {
    wall_time_ms: Option<u64>,
    cpu_time_ms: Option<u64>,
    memory_mb: Option<u64>,
    max_processes: Option<u64>,
    max_file_size_kb: Option<u64>,
}

impl RawLimits {
    fn over(&self, base: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            wall_time_ms: self.wall_time_ms.unwrap_or(base.wall_time_ms),
            cpu_time_ms: self.cpu_time_ms.unwrap_or(base.cpu_time_ms),
            memory_mb: self.memory_mb.unwrap_or(base.memory_mb),
            max_processes: self.max_processes.unwrap_or(base.max_processes),
            max_file_size_kb: self.max_file_size_kb.unwrap_or(base.max_file_size_kb),
        }
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLanguageConfig {
    extension: String,
    source_file: Option<String>,
    build_command: Option<String>,
    run_command: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    limits: RawLimits,
    max_limits: Option<RawLimits>,
    build_limits: Option<RawLimits>,
    #[serde(default = "default_true")]
    limit_address_space: bool,
    image: Option<ImageSpec>,
}

fn default_true() -> bool {
    true
}

impl RawLanguageConfig {
    fn into_spec(self, id: &str) -> Result<LanguageSpec> {
        let extension = self.extension.trim_start_matches('.').to_string();
        if extension.is_empty() {
            anyhow::bail!("Language {} has an empty extension", id);
        }

        let run_command = into_command(&self.run_command);
        if run_command.is_empty() {
            anyhow::bail!("Language {} has an empty run_command", id);
        }

        let build_command = match self.build_command.as_deref().map(into_command) {
            Some(cmd) if cmd.is_empty() => {
                anyhow::bail!("Language {} has an empty build_command", id)
            }
            other => other,
        };

        let default_limits = self.limits.over(&ResourceLimits::default());
        let max_limits = self
            .max_limits
            .as_ref()
            .map(|raw| raw.over(&default_limits))
            .unwrap_or(default_limits);
        if !default_limits.fits_within(&max_limits) {
            anyhow::bail!(
                "Language {} default limits {:?} exceed max_limits {:?}",
                id,
                default_limits,
                max_limits
            );
        }

        let build_limits = self
            .build_limits
            .as_ref()
            .map(|raw| raw.over(&ResourceLimits::build_default()));

        LanguageSpec {
            id: id.to_lowercase(),
            aliases: self.aliases.iter().map(|a| a.to_lowercase()).collect(),
            source_file: self
                .source_file
                .unwrap_or_else(|| format!("main.{}", extension)),
            extension,
            build_command,
            run_command,
            env: self.env,
            default_limits,
            max_limits,
            build_limits,
            limit_address_space: self.limit_address_space,
            image: self.image,
            version: String::new(),
        }
        .seal()
    }
}

/// Read-only registry of language specs, keyed by id and alias
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    specs: HashMap<String, Arc<LanguageSpec>>,
    ids: Vec<String>,
}

impl LanguageRegistry {
    /// Registry from the embedded language table
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_LANGUAGES).context("Invalid embedded language table")
    }

    /// Registry from a TOML file on disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read language table {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid language table {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw_configs: BTreeMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut registry = Self::default();
        for (name, raw) in raw_configs {
            let spec = raw
                .into_spec(&name)
                .with_context(|| format!("Invalid configuration for language {}", name))?;
            registry.insert(spec)?;
        }

        Ok(registry)
    }

    /// Register a spec under its id and aliases; any name collision is an error
    pub fn insert(&mut self, spec: LanguageSpec) -> Result<()> {
        let spec = Arc::new(spec);
        let names = std::iter::once(&spec.id).chain(spec.aliases.iter());
        for name in names.clone() {
            if self.specs.contains_key(name) {
                anyhow::bail!("Duplicate language identifier: {}", name);
            }
        }
        for name in names {
            self.specs.insert(name.clone(), spec.clone());
        }
        self.ids.push(spec.id.clone());
        Ok(())
    }

    /// Look up a language by id or alias (case-insensitive)
    pub fn resolve(&self, identifier: &str) -> Result<Arc<LanguageSpec>, Rejection> {
        self.specs
            .get(&identifier.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| Rejection::UnknownLanguage(identifier.to_string()))
    }

    /// All registered specs, one per language
    pub fn languages(&self) -> impl Iterator<Item = &Arc<LanguageSpec>> {
        self.ids.iter().filter_map(|id| self.specs.get(id))
    }

    /// Primary ids of all registered languages
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

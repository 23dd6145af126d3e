use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use runner::config::{BackendKind, RunnerConfig};
use runner::jobs::process_run_job;
use runner::languages::LanguageRegistry;
use runner::orchestrator::Orchestrator;
use runner::redis_manager::RedisManager;
use runner::sandbox::{DockerBackend, ProcessBackend, SandboxBackend};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("runner=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = RunnerConfig::from_env()?;
    info!("Starting runner worker ({:?} backend)...", config.backend);

    let registry = load_registry(&config)?;
    info!("Loaded {} languages: {}", registry.len(), registry.ids().join(", "));

    let backend = build_backend(&config)?;
    let capacity = config.orchestrator.workers + config.orchestrator.queue_capacity;
    info!(
        "Workers: {}, queue capacity: {}, scratch root: {:?}",
        config.orchestrator.workers,
        config.orchestrator.queue_capacity,
        config.orchestrator.session.scratch_root
    );
    let orchestrator = Orchestrator::new(registry, backend, config.orchestrator.clone());

    if config.prebuild {
        prebuild(&orchestrator).await;
    }

    spawn_reload_on_hangup(orchestrator.clone(), config.clone())?;

    let mut queue = RedisManager::connect(&config.redis_url).await?;
    let publisher = Arc::new(Mutex::new(queue.duplicate().await?));

    // Never pull more jobs than the orchestrator would admit
    let slots = Arc::new(Semaphore::new(capacity));

    info!("Waiting for jobs...");
    loop {
        let slot = slots
            .clone()
            .acquire_owned()
            .await
            .context("Job slots closed")?;

        let job = tokio::select! {
            job = queue.pop_job() => job?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down, waiting for {} running jobs", orchestrator.in_flight());
                break;
            }
        };

        let orchestrator = orchestrator.clone();
        let publisher = publisher.clone();
        tokio::spawn(async move {
            let _slot = slot;
            let response = process_run_job(&orchestrator, job).await;
            if let Err(e) = publisher.lock().await.store_response(&response).await {
                error!("Failed to store result for {}: {:#}", response.request_id, e);
            }
        });
    }

    // Wait for in-flight jobs to publish their results
    let _all = slots
        .acquire_many(capacity as u32)
        .await
        .context("Job slots closed")?;
    info!("Runner stopped");
    Ok(())
}

fn load_registry(config: &RunnerConfig) -> Result<LanguageRegistry> {
    match &config.languages_config {
        Some(path) => LanguageRegistry::from_file(path),
        None => LanguageRegistry::builtin(),
    }
}

fn build_backend(config: &RunnerConfig) -> Result<Arc<dyn SandboxBackend>> {
    match config.backend {
        BackendKind::Process => {
            let backend = match config.sandbox_uid {
                Some(uid) => {
                    let gid = config.sandbox_gid.unwrap_or(uid);
                    info!("Sandboxed commands run as {}:{}", uid, gid);
                    ProcessBackend::new().with_identity(uid, gid)?
                }
                None => {
                    warn!("RUNNER_SANDBOX_UID not set, sandboxed commands share the runner's uid");
                    ProcessBackend::new()
                }
            };
            Ok(Arc::new(backend))
        }
        BackendKind::Docker => {
            let mut backend = DockerBackend::new(&config.docker_binary, &config.image_prefix);
            if let Some(uid) = config.sandbox_uid {
                backend = backend.with_uid(uid);
            }
            Ok(Arc::new(backend))
        }
    }
}

/// Build every language up front; failures are logged and retried on first use
async fn prebuild(orchestrator: &Orchestrator) {
    let registry = orchestrator.registry().await;
    for spec in registry.languages() {
        if let Err(e) = orchestrator.builder().ensure_ready(spec).await {
            warn!("Prebuild failed: {}", e);
        }
    }
}

/// Reload the language table on SIGHUP
fn spawn_reload_on_hangup(orchestrator: Orchestrator, config: RunnerConfig) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match load_registry(&config) {
                Ok(registry) => orchestrator.reload_registry(registry).await,
                Err(e) => error!("Keeping current languages, reload failed: {:#}", e),
            }
        }
    });
    Ok(())
}

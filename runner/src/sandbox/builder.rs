//! Sandbox builder
//!
//! Makes sure a ready sandbox exists for a language before any session uses it.
//! Builds are single-flight per language: concurrent callers share one in-flight
//! build, and a failed build leaves nothing behind so the next caller retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OnceCell};
use tracing::{error, info};

use super::{SandboxBackend, SandboxHandle};
use crate::error::BuildFailed;
use crate::languages::LanguageSpec;

/// Build cell for the current version of one language
struct Slot {
    version: String,
    cell: Arc<OnceCell<SandboxHandle>>,
}

pub struct SandboxBuilder {
    backend: Arc<dyn SandboxBackend>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SandboxBuilder {
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    /// Return the ready handle for `spec`, building it first if needed.
    ///
    /// A spec whose version differs from the cached one gets a fresh build.
    pub async fn ensure_ready(&self, spec: &LanguageSpec) -> Result<SandboxHandle, BuildFailed> {
        let cell = {
            let mut slots = self.slots.lock().await;
            let current = slots
                .get(&spec.id)
                .filter(|slot| slot.version == spec.version())
                .map(|slot| slot.cell.clone());
            match current {
                Some(cell) => cell,
                None => {
                    if slots.contains_key(&spec.id) {
                        info!(
                            "Language {} changed (now {}), sandbox will be rebuilt",
                            spec.id,
                            spec.short_version()
                        );
                    }
                    let cell = Arc::new(OnceCell::new());
                    slots.insert(
                        spec.id.clone(),
                        Slot {
                            version: spec.version().to_string(),
                            cell: cell.clone(),
                        },
                    );
                    cell
                }
            }
        };

        cell.get_or_try_init(|| async {
            let start = Instant::now();
            info!(
                "Building {} sandbox for {} ({})",
                self.backend.name(),
                spec.id,
                spec.short_version()
            );
            let image = self.backend.build(spec).await?;
            info!(
                "Sandbox for {} ready in {}ms: {}",
                spec.id,
                start.elapsed().as_millis(),
                image.reference
            );
            Ok::<_, anyhow::Error>(SandboxHandle::new(spec, self.backend.name(), image))
        })
        .await
        .cloned()
        .map_err(|e| {
            error!("Sandbox build for {} failed: {:#}", spec.id, e);
            BuildFailed {
                language: spec.id.clone(),
                reason: format!("{:#}", e),
            }
        })
    }

    /// Ready handle for `id`, if one has been built
    pub async fn current(&self, id: &str) -> Option<SandboxHandle> {
        let slots = self.slots.lock().await;
        slots.get(id).and_then(|slot| slot.cell.get().cloned())
    }

    /// Forget the handle for `id`; the next `ensure_ready` rebuilds
    pub async fn invalidate(&self, id: &str) -> bool {
        self.slots.lock().await.remove(id).is_some()
    }
}

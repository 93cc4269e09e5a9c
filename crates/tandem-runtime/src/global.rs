//! Process-wide orchestrator
//!
//! The C API addresses one orchestrator per process. It is created lazily
//! on first [`acquire`] and torn down with [`reset`]. Callers hold the
//! returned guard for the duration of one API call, which serializes
//! mutating calls.

use std::sync::{Arc, OnceLock};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tandem_backends::{Backend, SimConfig};

use crate::config::RuntimeConfig;
use crate::device;
use crate::entry::StaticEntries;
use crate::orchestrator::Orchestrator;

static ORCHESTRATOR: OnceLock<Mutex<Option<Orchestrator>>> = OnceLock::new();
static ENTRIES: OnceLock<StaticEntries> = OnceLock::new();

fn slot() -> &'static Mutex<Option<Orchestrator>> {
    ORCHESTRATOR.get_or_init(|| Mutex::new(None))
}

fn default_backend() -> Arc<dyn Backend> {
    #[cfg(feature = "hardware")]
    if std::env::var("TANDEM_BACKEND").is_ok_and(|v| v.eq_ignore_ascii_case("hardware")) {
        match tandem_backends::HwBackend::new(tandem_backends::HwConfig::default()) {
            Ok(hw) => return Arc::new(hw),
            Err(e) => tracing::warn!(error = %e, "hardware_backend_unavailable_using_sim"),
        }
    }
    Arc::new(device::simulated_backend(SimConfig::default()))
}

/// Lock the global orchestrator, creating it on first use
pub fn acquire() -> MappedMutexGuard<'static, Orchestrator> {
    MutexGuard::map(slot().lock(), |current| {
        current.get_or_insert_with(|| {
            let backend = default_backend();
            tracing::info!(backend = backend.name(), "global_orchestrator_created");
            Orchestrator::new(backend, RuntimeConfig::from_env())
        })
    })
}

/// Replace the global orchestrator; the previous one is finalized
pub fn install(orchestrator: Orchestrator) {
    let previous = slot().lock().replace(orchestrator);
    finalize_previous(previous);
}

/// Finalize and drop the global orchestrator; the next [`acquire`] starts fresh
pub fn reset() {
    let previous = slot().lock().take();
    finalize_previous(previous);
}

fn finalize_previous(previous: Option<Orchestrator>) {
    if let Some(mut orchestrator) = previous {
        if let Err(e) = orchestrator.finalize() {
            tracing::warn!(error = %e, "global_finalize_failed");
        }
    }
}

/// Entry table consulted by sessions created through the C API
pub fn entries() -> &'static StaticEntries {
    ENTRIES.get_or_init(StaticEntries::new)
}

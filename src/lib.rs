//! Drives a docker compose test environment: brings it up, splits the
//! combined output into per-service log queues, offers a sync barrier on
//! those queues, tracks worker replacement across reloads and runs
//! short-lived extra processes inside service containers.

pub mod classify;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod http;
pub mod journal;
pub mod orchestration;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod sync;
pub mod transient;
pub mod wait;
pub mod workers;

#[cfg(test)]
mod testing;

pub use classify::{LogEvent, OutputClassifier, TeardownEvent};
pub use config::Config;
pub use error::{HarnessError, Result};
pub use orchestration::Orchestration;
pub use session::{Lease, Lifecycle, Session};
pub use sync::SyncToken;
pub use transient::{TransientProcess, TransientSpec};
pub use workers::WorkerPidSet;

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a stderr `fmt` subscriber honouring `RUST_LOG` (default `info`).
/// Later calls do nothing.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = TRACING_INIT.set(());
}

//! Service Host: local persistence and synchronization engine.
//!
//! Keeps a restaurant POS terminal fully operational when the central cloud
//! is unreachable: a WAL-journaled SQLite store mirrors cloud-owned
//! configuration, buffers every local mutation in a durable sync outbox,
//! arbitrates concurrent check edits across workstations, issues
//! collision-free check numbers from pre-assigned ranges, and spools print
//! jobs against flaky hardware.
//!
//! The terminal-operations layer composes these parts per POS action:
//! acquire the check lock, write locally, enqueue the outbox entry, spool
//! the ticket. Cloud delivery and printer dispatch are injected behind the
//! [`CloudTransport`] and [`PrintTransport`] traits; background drain loops
//! run on tokio and stop via a `CancellationToken`.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod check_locks;
mod check_numbers;
mod config_cache;
pub mod db;
mod error;
mod print_queue;
mod sync_queue;

pub use check_locks::{CheckLock, CheckLockManager};
pub use check_numbers::{CheckNumberAllocator, WorkstationConfig};
pub use config_cache::ConfigMirror;
pub use db::DbState;
pub use error::{HostError, Result};
pub use print_queue::{PrintJob, PrintJobStatus, PrintQueue, PrintTransport, PrintWorkerConfig};
pub use sync_queue::{CloudTransport, DrainConfig, SyncEnvelope, SyncOutbox, SyncQueueItem};

/// Initialize structured logging (console + daily rolling file).
///
/// Call once from the host binary before anything else; keep the returned
/// guard alive for the process lifetime; dropping it flushes the file
/// writer. Returns `None` when a subscriber is already installed (tests).
pub fn init_logging(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,service_host=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "service-host");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    installed.then_some(guard)
}

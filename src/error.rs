//! Error types for the local persistence and sync engine.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors surfaced by the store and its consumers.
///
/// Negative outcomes that are part of normal operation (lock conflict,
/// check-number range exhaustion) are *not* errors; they come back as
/// `Ok(false)` / `Ok(None)` from the relevant calls.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{context}: {source}")]
    Sql {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration v{version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database mutex poisoned")]
    Poisoned,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid {what}: {detail}")]
    Invalid { what: &'static str, detail: String },

    #[error("drain cycle already in progress")]
    DrainBusy,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Attach a static context string to a rusqlite error.
///
/// Usage: `conn.execute(...).map_err(sql("enqueue sync item"))?`
pub(crate) fn sql(context: &'static str) -> impl FnOnce(rusqlite::Error) -> HostError {
    move |source| HostError::Sql { context, source }
}

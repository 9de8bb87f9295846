//! Cross-workstation check locking.
//!
//! Two terminals sharing one dataset could otherwise both believe they own
//! an open check. Every check edit goes through `acquire` first; a foreign
//! non-expired lock means the caller surfaces "check is being edited
//! elsewhere" instead of writing. Expired locks are swept lazily on the next
//! acquire attempt; every read path filters by `expires_at`, so a lingering
//! row is a cosmetic artifact, not a correctness issue.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::{now_rfc3339, rfc3339_after, DbState};
use crate::error::{sql, Result};

/// Default lock type recorded when the caller does not specify one.
const DEFAULT_LOCK_TYPE: &str = "edit";

/// One live (or not-yet-swept) lock row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckLock {
    pub check_id: String,
    pub workstation_id: String,
    pub employee_id: String,
    pub lock_type: String,
    pub locked_at: String,
    pub expires_at: String,
}

/// Mutual exclusion over concurrently-editable checks.
#[derive(Clone)]
pub struct CheckLockManager {
    db: Arc<DbState>,
}

impl CheckLockManager {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Try to take (or refresh) the edit lock on a check.
    ///
    /// Returns `true` when the lock is granted: either no live lock exists,
    /// or the same workstation already holds it (re-entrant refresh, which
    /// extends `expires_at`). Returns `false` when a different workstation
    /// holds a non-expired lock, which is a normal negative result, not an error.
    /// Acquisition never blocks.
    pub fn acquire(
        &self,
        check_id: &str,
        workstation_id: &str,
        employee_id: &str,
        duration_secs: i64,
    ) -> Result<bool> {
        self.acquire_typed(
            check_id,
            workstation_id,
            employee_id,
            DEFAULT_LOCK_TYPE,
            duration_secs,
        )
    }

    /// [`acquire`](Self::acquire) with an explicit lock type.
    pub fn acquire_typed(
        &self,
        check_id: &str,
        workstation_id: &str,
        employee_id: &str,
        lock_type: &str,
        duration_secs: i64,
    ) -> Result<bool> {
        let now = now_rfc3339();
        let expires_at = rfc3339_after(duration_secs);

        let granted = self.db.with_transaction(|tx| {
            // Lazy sweep: expiry-driven garbage collection happens here, on
            // the acquire path, rather than on a background timer.
            tx.execute(
                "DELETE FROM check_locks WHERE expires_at <= ?1",
                params![now],
            )
            .map_err(sql("sweep expired locks"))?;

            let holder: Option<String> = tx
                .query_row(
                    "SELECT workstation_id FROM check_locks WHERE check_id = ?1",
                    params![check_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql("read lock holder"))?;

            if let Some(holder) = holder {
                if holder != workstation_id {
                    return Ok(false);
                }
            }

            tx.execute(
                "INSERT INTO check_locks (check_id, workstation_id, employee_id, lock_type,
                                          locked_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(check_id) DO UPDATE SET
                    workstation_id = excluded.workstation_id,
                    employee_id = excluded.employee_id,
                    lock_type = excluded.lock_type,
                    locked_at = excluded.locked_at,
                    expires_at = excluded.expires_at",
                params![check_id, workstation_id, employee_id, lock_type, now, expires_at],
            )
            .map_err(sql("write check lock"))?;
            Ok(true)
        })?;

        if granted {
            debug!(check_id = %check_id, workstation_id = %workstation_id, "Check lock granted");
        } else {
            debug!(check_id = %check_id, workstation_id = %workstation_id,
                   "Check lock denied: held by another workstation");
        }
        Ok(granted)
    }

    /// Release a lock, but only if the calling workstation owns it.
    pub fn release(&self, check_id: &str, workstation_id: &str) -> Result<bool> {
        let affected = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM check_locks WHERE check_id = ?1 AND workstation_id = ?2",
                params![check_id, workstation_id],
            )
            .map_err(sql("release check lock"))
        })?;
        Ok(affected > 0)
    }

    /// Release every lock held by a workstation. Called on disconnect or
    /// logoff so orphaned locks do not outlive a terminal session.
    pub fn release_all(&self, workstation_id: &str) -> Result<usize> {
        let released = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM check_locks WHERE workstation_id = ?1",
                params![workstation_id],
            )
            .map_err(sql("release all workstation locks"))
        })?;
        if released > 0 {
            info!(workstation_id = %workstation_id, released, "Workstation locks released");
        }
        Ok(released)
    }

    /// Look up the live lock on a check, if any. Expired rows are filtered
    /// out even when the sweep has not caught them yet.
    pub fn get_lock(&self, check_id: &str) -> Result<Option<CheckLock>> {
        let now = now_rfc3339();
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT check_id, workstation_id, employee_id, lock_type, locked_at, expires_at
                 FROM check_locks
                 WHERE check_id = ?1 AND expires_at > ?2",
                params![check_id, now],
                row_to_lock,
            )
            .optional()
            .map_err(sql("get check lock"))
        })
    }

    /// Live locks held by one workstation (shutdown diagnostics surface).
    pub fn active_locks(&self, workstation_id: &str) -> Result<Vec<CheckLock>> {
        let now = now_rfc3339();
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT check_id, workstation_id, employee_id, lock_type, locked_at, expires_at
                     FROM check_locks
                     WHERE workstation_id = ?1 AND expires_at > ?2
                     ORDER BY locked_at ASC",
                )
                .map_err(sql("prepare active_locks"))?;
            let locks = stmt
                .query_map(params![workstation_id, now], row_to_lock)
                .map_err(sql("query active_locks"))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(locks)
        })
    }

    /// Delete expired lock rows immediately.
    ///
    /// The acquire path already sweeps lazily; this is a maintenance entry
    /// point a host can schedule if lock-acquisition traffic is too low to
    /// keep the table bounded. Returns the number of rows removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = now_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM check_locks WHERE expires_at <= ?1",
                params![now],
            )
            .map_err(sql("sweep expired locks"))
        })
    }
}

fn row_to_lock(row: &Row<'_>) -> rusqlite::Result<CheckLock> {
    Ok(CheckLock {
        check_id: row.get(0)?,
        workstation_id: row.get(1)?,
        employee_id: row.get(2)?,
        lock_type: row.get(3)?,
        locked_at: row.get(4)?,
        expires_at: row.get(5)?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

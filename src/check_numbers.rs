//! Per-workstation check-number allocation.
//!
//! The cloud pre-assigns each workstation a disjoint numeric range so
//! terminals can issue human-readable check numbers while offline without
//! colliding. The cursor is strictly non-decreasing and a number is never
//! issued twice; a drained range yields `None` until the cloud assigns a
//! fresh one.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{now_rfc3339, DbState};
use crate::error::{sql, HostError, Result};

/// One workstation's registration row: check-number range cursor plus
/// offline/sync bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkstationConfig {
    pub workstation_id: String,
    pub check_number_start: i64,
    pub check_number_end: i64,
    pub current_check_number: i64,
    pub offline_mode_enabled: bool,
    pub last_sync_at: Option<String>,
    pub last_seen_at: Option<String>,
}

/// Collision-free check-number issuance over `workstation_config`.
#[derive(Clone)]
pub struct CheckNumberAllocator {
    db: Arc<DbState>,
}

impl CheckNumberAllocator {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Register a workstation with its cloud-assigned range `[start, end)`.
    ///
    /// A *new* range resets the cursor to `start`; re-registering the same
    /// range keeps the cursor where it was, so a terminal restart never
    /// reissues numbers.
    pub fn register_workstation(&self, workstation_id: &str, start: i64, end: i64) -> Result<()> {
        if start >= end {
            return Err(HostError::Invalid {
                what: "check number range",
                detail: format!("[{start}, {end}) is empty"),
            });
        }

        self.db.with_transaction(|tx| {
            let existing: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT check_number_start, check_number_end
                     FROM workstation_config WHERE workstation_id = ?1",
                    params![workstation_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql("read workstation range"))?;

            match existing {
                Some((old_start, old_end)) if old_start == start && old_end == end => {
                    // Same range: keep the cursor (restart-safe)
                }
                Some(_) => {
                    tx.execute(
                        "UPDATE workstation_config
                         SET check_number_start = ?2,
                             check_number_end = ?3,
                             current_check_number = ?2
                         WHERE workstation_id = ?1",
                        params![workstation_id, start, end],
                    )
                    .map_err(sql("update workstation range"))?;
                    info!(workstation_id = %workstation_id, start, end,
                          "Workstation check-number range reassigned");
                }
                None => {
                    tx.execute(
                        "INSERT INTO workstation_config
                             (workstation_id, check_number_start, check_number_end,
                              current_check_number)
                         VALUES (?1, ?2, ?3, ?2)",
                        params![workstation_id, start, end],
                    )
                    .map_err(sql("insert workstation config"))?;
                    info!(workstation_id = %workstation_id, start, end,
                          "Workstation registered");
                }
            }
            Ok(())
        })
    }

    /// Issue the next check number for a workstation.
    ///
    /// Atomic read-then-increment in a single transaction, so two
    /// near-simultaneous calls on the same workstation cannot race into the
    /// same number. Returns `None` once the range is drained, at which point the caller
    /// must request a fresh range from the cloud; numbers never wrap and are
    /// never reused. Unknown workstation is an error.
    pub fn get_next_check_number(&self, workstation_id: &str) -> Result<Option<i64>> {
        let issued = self.db.with_transaction(|tx| {
            let row: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT current_check_number, check_number_end
                     FROM workstation_config WHERE workstation_id = ?1",
                    params![workstation_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql("read check number cursor"))?;
            let Some((current, end)) = row else {
                return Err(HostError::NotFound {
                    kind: "workstation",
                    id: workstation_id.to_string(),
                });
            };

            if current >= end {
                return Ok(None);
            }

            tx.execute(
                "UPDATE workstation_config
                 SET current_check_number = ?2
                 WHERE workstation_id = ?1",
                params![workstation_id, current + 1],
            )
            .map_err(sql("advance check number cursor"))?;
            Ok(Some(current))
        })?;

        match issued {
            Some(number) => debug!(workstation_id = %workstation_id, number, "Check number issued"),
            None => warn!(workstation_id = %workstation_id,
                          "Check number range exhausted; new range required from cloud"),
        }
        Ok(issued)
    }

    /// Numbers left in the workstation's range, for low-range warnings
    /// ahead of a sustained offline stretch.
    pub fn remaining_numbers(&self, workstation_id: &str) -> Result<i64> {
        let config = self.require(workstation_id)?;
        Ok((config.check_number_end - config.current_check_number).max(0))
    }

    /// Fetch a workstation's config row.
    pub fn get_workstation(&self, workstation_id: &str) -> Result<Option<WorkstationConfig>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT workstation_id, check_number_start, check_number_end,
                        current_check_number, offline_mode_enabled, last_sync_at, last_seen_at
                 FROM workstation_config WHERE workstation_id = ?1",
                params![workstation_id],
                row_to_config,
            )
            .optional()
            .map_err(sql("get workstation config"))
        })
    }

    /// Flip the workstation's offline-mode flag.
    pub fn set_offline_mode(&self, workstation_id: &str, enabled: bool) -> Result<()> {
        self.update_flag(
            workstation_id,
            "UPDATE workstation_config SET offline_mode_enabled = ?2 WHERE workstation_id = ?1",
            enabled,
        )?;
        info!(workstation_id = %workstation_id, enabled, "Offline mode toggled");
        Ok(())
    }

    /// Stamp `last_sync_at = now` after a successful drain against the cloud.
    pub fn mark_synced(&self, workstation_id: &str) -> Result<()> {
        let now = now_rfc3339();
        let affected = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workstation_config SET last_sync_at = ?2 WHERE workstation_id = ?1",
                params![workstation_id, now],
            )
            .map_err(sql("mark workstation synced"))
        })?;
        self.check_affected(workstation_id, affected)
    }

    /// Heartbeat: stamp `last_seen_at = now`.
    pub fn touch_last_seen(&self, workstation_id: &str) -> Result<()> {
        let now = now_rfc3339();
        let affected = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE workstation_config SET last_seen_at = ?2 WHERE workstation_id = ?1",
                params![workstation_id, now],
            )
            .map_err(sql("touch workstation last_seen"))
        })?;
        self.check_affected(workstation_id, affected)
    }

    fn update_flag(&self, workstation_id: &str, stmt: &str, value: bool) -> Result<()> {
        let affected = self.db.with_conn(|conn| {
            conn.execute(stmt, params![workstation_id, value])
                .map_err(sql("update workstation flag"))
        })?;
        self.check_affected(workstation_id, affected)
    }

    fn check_affected(&self, workstation_id: &str, affected: usize) -> Result<()> {
        if affected == 0 {
            return Err(HostError::NotFound {
                kind: "workstation",
                id: workstation_id.to_string(),
            });
        }
        Ok(())
    }

    fn require(&self, workstation_id: &str) -> Result<WorkstationConfig> {
        self.get_workstation(workstation_id)?
            .ok_or_else(|| HostError::NotFound {
                kind: "workstation",
                id: workstation_id.to_string(),
            })
    }
}

fn row_to_config(row: &Row<'_>) -> rusqlite::Result<WorkstationConfig> {
    Ok(WorkstationConfig {
        workstation_id: row.get(0)?,
        check_number_start: row.get(1)?,
        check_number_end: row.get(2)?,
        current_check_number: row.get(3)?,
        offline_mode_enabled: row.get(4)?,
        last_sync_at: row.get(5)?,
        last_seen_at: row.get(6)?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

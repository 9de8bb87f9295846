//! Sync outbox for the Service Host.
//!
//! Every local mutation that must reach the cloud is appended here first;
//! a background drain loop batches eligible items and hands them to the
//! [`CloudTransport`] one at a time. Failures re-schedule with linear
//! backoff. An item that exhausts its attempts is never deleted: it stays
//! queryable with its last error for operator reconciliation.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{now_rfc3339, rfc3339_after, DbState};
use crate::error::{sql, HostError, Result};

/// Default linear backoff unit: attempt n is retried after `n * 30s`.
const DEFAULT_BACKOFF_UNIT_SECS: i64 = 30;
/// Default attempt cap for newly enqueued items.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// One buffered local mutation awaiting cloud delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub payload: String,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Option<String>,
    pub next_attempt_at: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
}

impl SyncQueueItem {
    /// The delivery envelope handed to the cloud transport.
    pub fn envelope(&self) -> Result<SyncEnvelope> {
        Ok(SyncEnvelope {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            action: self.action.clone(),
            payload: serde_json::from_str(&self.payload)?,
        })
    }
}

/// Wire envelope for one drained mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub payload: Value,
}

/// Cloud delivery hook implemented by the (out-of-scope) API client.
///
/// `deliver` resolves `Ok(())` only on a confirmed cloud acknowledgment;
/// any transport-level or application-level failure comes back as an error
/// string that ends up in the item's `error_message`.
pub trait CloudTransport: Send + Sync + 'static {
    fn deliver(
        &self,
        envelope: SyncEnvelope,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send + '_>>;
}

/// Tuning for the background drain loop.
#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Pause between drain cycles.
    pub interval: Duration,
    /// Maximum items pulled per cycle.
    pub batch_limit: usize,
    /// Upper bound on a single delivery attempt. A timed-out attempt counts
    /// as a failed attempt.
    pub attempt_timeout: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            batch_limit: 50,
            attempt_timeout: Duration::from_secs(20),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Durable, retryable outbox over the `sync_queue` table.
#[derive(Clone)]
pub struct SyncOutbox {
    db: Arc<DbState>,
    backoff_unit_secs: i64,
    default_max_attempts: u32,
    draining: Arc<AtomicBool>,
    last_drain_at: Arc<Mutex<Option<String>>>,
}

impl SyncOutbox {
    pub fn new(db: Arc<DbState>) -> Self {
        Self {
            db,
            backoff_unit_secs: DEFAULT_BACKOFF_UNIT_SECS,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            draining: Arc::new(AtomicBool::new(false)),
            last_drain_at: Arc::new(Mutex::new(None)),
        }
    }

    /// Override the linear backoff unit (mainly for tests).
    pub fn with_backoff_unit_secs(mut self, secs: i64) -> Self {
        self.backoff_unit_secs = secs;
        self
    }

    /// Override the attempt cap applied to newly enqueued items.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Append a mutation to the outbox. Eligible immediately
    /// (`next_attempt_at = now`, `attempts = 0`).
    pub fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        action: &str,
        payload: &Value,
        priority: i64,
    ) -> Result<i64> {
        let payload_json = serde_json::to_string(payload)?;
        let now = now_rfc3339();

        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_queue (entity_type, entity_id, action, payload, priority,
                                         attempts, max_attempts, next_attempt_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)",
                params![
                    entity_type,
                    entity_id,
                    action,
                    payload_json,
                    priority,
                    self.default_max_attempts,
                    now
                ],
            )
            .map_err(sql("enqueue sync item"))?;
            Ok(conn.last_insert_rowid())
        })?;

        debug!(id, entity_type = %entity_type, entity_id = %entity_id, action = %action,
               "Sync item enqueued");
        Ok(id)
    }

    /// Pull items due for a delivery attempt.
    ///
    /// Higher priority first, FIFO within a priority tier, so close-of-check
    /// and payment events can be drained ahead of low-value telemetry.
    pub fn dequeue_eligible(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        let now = now_rfc3339();
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, entity_type, entity_id, action, payload, priority,
                            attempts, max_attempts, last_attempt_at, next_attempt_at,
                            error_message, created_at
                     FROM sync_queue
                     WHERE attempts < max_attempts
                       AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                     ORDER BY priority DESC, created_at ASC, id ASC
                     LIMIT ?2",
                )
                .map_err(sql("prepare dequeue_eligible"))?;
            let items = stmt
                .query_map(params![now, limit as i64], row_to_item)
                .map_err(sql("query dequeue_eligible"))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(items)
        })
    }

    /// Record a failed (or aborted) delivery attempt.
    ///
    /// Increments `attempts`, stamps `last_attempt_at`, and pushes
    /// `next_attempt_at` forward by `attempts * backoff_unit`: linear
    /// backoff, bounded above by the attempt cap so the delay series is
    /// finite and deterministic. Returns the new attempt count.
    pub fn mark_attempt(&self, id: i64, error: Option<&str>) -> Result<u32> {
        let backoff_unit = self.backoff_unit_secs;
        self.db.with_transaction(|tx| {
            let attempts: Option<u32> = tx
                .query_row(
                    "SELECT attempts FROM sync_queue WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql("read sync item attempts"))?;
            let Some(attempts) = attempts else {
                return Err(HostError::NotFound {
                    kind: "sync queue item",
                    id: id.to_string(),
                });
            };

            let new_attempts = attempts + 1;
            let now = now_rfc3339();
            let next = rfc3339_after(backoff_unit * new_attempts as i64);
            tx.execute(
                "UPDATE sync_queue
                 SET attempts = ?1,
                     last_attempt_at = ?2,
                     next_attempt_at = ?3,
                     error_message = COALESCE(?4, error_message)
                 WHERE id = ?5",
                params![new_attempts, now, next, error, id],
            )
            .map_err(sql("mark sync attempt"))?;
            Ok(new_attempts)
        })
    }

    /// Delete an item on confirmed cloud delivery (or explicit operator
    /// removal). The only two ways an item ever leaves the queue.
    pub fn remove(&self, id: i64) -> Result<bool> {
        let affected = self.db.with_conn(|conn| {
            conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])
                .map_err(sql("remove sync item"))
        })?;
        Ok(affected > 0)
    }

    /// Items still awaiting delivery, for connectivity/health indicators.
    pub fn pending_count(&self) -> Result<i64> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE attempts < max_attempts",
                [],
                |row| row.get(0),
            )
            .map_err(sql("pending sync count"))
        })
    }

    /// Direct lookup by id, regardless of eligibility.
    pub fn get_item(&self, id: i64) -> Result<Option<SyncQueueItem>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, entity_type, entity_id, action, payload, priority,
                        attempts, max_attempts, last_attempt_at, next_attempt_at,
                        error_message, created_at
                 FROM sync_queue WHERE id = ?1",
                params![id],
                row_to_item,
            )
            .optional()
            .map_err(sql("get sync item"))
        })
    }

    /// Items that exhausted their attempt cap, retained for manual triage.
    pub fn exhausted_items(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, entity_type, entity_id, action, payload, priority,
                            attempts, max_attempts, last_attempt_at, next_attempt_at,
                            error_message, created_at
                     FROM sync_queue
                     WHERE attempts >= max_attempts
                     ORDER BY created_at ASC
                     LIMIT ?1",
                )
                .map_err(sql("prepare exhausted_items"))?;
            let items = stmt
                .query_map(params![limit as i64], row_to_item)
                .map_err(sql("query exhausted_items"))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(items)
        })
    }

    /// Timestamp of the last completed drain cycle, if any.
    pub fn last_drain_at(&self) -> Option<String> {
        self.last_drain_at.lock().ok().and_then(|g| g.clone())
    }

    // -----------------------------------------------------------------
    // Drain loop
    // -----------------------------------------------------------------

    /// Run one drain cycle: pull eligible items and attempt delivery.
    ///
    /// Single-flight: a second cycle started while one is in progress gets
    /// `HostError::DrainBusy` instead of double-delivering the same items.
    /// Each attempt is bounded by `cfg.attempt_timeout`; a timeout or a
    /// cancellation mid-attempt is recorded as a failed attempt. Returns the
    /// number of items confirmed delivered.
    pub async fn run_drain_cycle<T: CloudTransport>(
        &self,
        transport: &T,
        cfg: &DrainConfig,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if self.draining.swap(true, Ordering::SeqCst) {
            return Err(HostError::DrainBusy);
        }
        let outcome = self.drain_once(transport, cfg, cancel).await;
        self.draining.store(false, Ordering::SeqCst);
        outcome
    }

    async fn drain_once<T: CloudTransport>(
        &self,
        transport: &T,
        cfg: &DrainConfig,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let items = self.dequeue_eligible(cfg.batch_limit)?;
        if items.is_empty() {
            return Ok(0);
        }

        let mut delivered = 0usize;
        for item in items {
            let envelope = match item.envelope() {
                Ok(env) => env,
                Err(e) => {
                    // Undeliverable payload: burn an attempt so the item
                    // eventually parks in the exhausted set for triage.
                    warn!(id = item.id, "Sync payload unreadable: {e}");
                    self.mark_attempt(item.id, Some(&format!("payload unreadable: {e}")))?;
                    continue;
                }
            };

            let attempt = tokio::time::timeout(cfg.attempt_timeout, transport.deliver(envelope));
            tokio::select! {
                _ = cancel.cancelled() => {
                    // An aborted attempt counts as a failed attempt; the
                    // item's bookkeeping stays consistent.
                    self.mark_attempt(item.id, Some("delivery aborted by shutdown"))?;
                    info!(id = item.id, "Drain cycle cancelled mid-attempt");
                    break;
                }
                result = attempt => match result {
                    Ok(Ok(())) => {
                        self.remove(item.id)?;
                        delivered += 1;
                        debug!(id = item.id, entity_type = %item.entity_type,
                               "Sync item delivered");
                    }
                    Ok(Err(err)) => {
                        let attempts = self.mark_attempt(item.id, Some(&err))?;
                        if attempts >= item.max_attempts {
                            warn!(id = item.id, attempts, error = %err,
                                  "Sync item exhausted; retained for manual reconciliation");
                        } else {
                            debug!(id = item.id, attempts, error = %err,
                                   "Sync delivery failed; backing off");
                        }
                    }
                    Err(_) => {
                        self.mark_attempt(
                            item.id,
                            Some(&format!(
                                "delivery timed out after {:?}",
                                cfg.attempt_timeout
                            )),
                        )?;
                        debug!(id = item.id, "Sync delivery timed out");
                    }
                },
            }
        }

        if let Ok(mut guard) = self.last_drain_at.lock() {
            *guard = Some(now_rfc3339());
        }
        Ok(delivered)
    }

    /// Start the background drain loop.
    ///
    /// Runs a cycle every `cfg.interval`; the loop structure guarantees a
    /// new cycle never starts before the previous one finishes. Cancel via
    /// the token to stop (in-flight attempts are aborted and counted).
    pub fn start_drain_loop<T: CloudTransport>(
        &self,
        transport: Arc<T>,
        cfg: DrainConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let outbox = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = cfg.interval.as_secs(), "Sync drain loop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Sync drain loop stopped");
                        break;
                    }
                    _ = tokio::time::sleep(cfg.interval) => {}
                }

                match outbox.run_drain_cycle(transport.as_ref(), &cfg, &cancel).await {
                    Ok(delivered) if delivered > 0 => {
                        info!(delivered, "Drain cycle complete");
                    }
                    Ok(_) => {}
                    Err(HostError::DrainBusy) => {
                        // Only reachable when a manual force-drain overlaps
                        // the loop; skip this tick rather than double-deliver.
                        debug!("Drain cycle skipped: another drain in progress");
                    }
                    Err(e) => warn!("Drain cycle failed: {e}"),
                }
            }
        })
    }
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<SyncQueueItem> {
    Ok(SyncQueueItem {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        action: row.get(3)?,
        payload: row.get(4)?,
        priority: row.get(5)?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        last_attempt_at: row.get(8)?,
        next_attempt_at: row.get(9)?,
        error_message: row.get(10)?,
        created_at: row.get(11)?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

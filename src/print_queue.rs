//! Print spooler for the Service Host.
//!
//! Decouples "send to kitchen / print receipt" business events from
//! unreliable physical I/O: a printer that is offline, jammed, or slow must
//! never block check or payment processing. Jobs are enqueued durably and a
//! background worker drains them against the hardware, one in-flight job per
//! physical printer so output order on a device is never scrambled, while
//! distinct printers print concurrently.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{now_rfc3339, DbState};
use crate::error::{sql, HostError, Result};

/// Print attempts are capped low: a failed print has a narrower blast
/// radius than a failed financial sync, so five strikes park the job for
/// operator action.
const PRINT_MAX_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// Lifecycle of a spooled print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintJobStatus {
    Pending,
    Printing,
    Completed,
    Failed,
}

impl PrintJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrintJobStatus::Pending => "pending",
            PrintJobStatus::Printing => "printing",
            PrintJobStatus::Completed => "completed",
            PrintJobStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "printing" => PrintJobStatus::Printing,
            "completed" => PrintJobStatus::Completed,
            "failed" => PrintJobStatus::Failed,
            _ => PrintJobStatus::Pending,
        }
    }
}

/// One spooled job addressed to a physical printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: String,
    pub printer_id: String,
    pub printer_address: String,
    pub printer_port: u16,
    pub job_type: String,
    pub content: String,
    pub status: PrintJobStatus,
    pub priority: i64,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Hardware dispatch hook implemented by the (out-of-scope) driver layer.
///
/// The queue only guarantees delivery *attempts*; protocol specifics
/// (ESC/POS and friends) live behind this trait.
pub trait PrintTransport: Send + Sync + 'static {
    fn print(
        &self,
        job: PrintJob,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send + '_>>;
}

/// Tuning for the background print worker.
#[derive(Debug, Clone)]
pub struct PrintWorkerConfig {
    /// Pause between drain cycles.
    pub interval: Duration,
    /// Maximum jobs pulled per cycle (across all printers).
    pub batch_limit: usize,
    /// Upper bound on a single print attempt.
    pub attempt_timeout: Duration,
}

impl Default for PrintWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_limit: 20,
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Durable print job queue over the `print_jobs` table.
#[derive(Clone)]
pub struct PrintQueue {
    db: Arc<DbState>,
}

impl PrintQueue {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Spool a new job. Returns the job id.
    pub fn add_print_job(
        &self,
        printer_id: &str,
        address: &str,
        port: u16,
        job_type: &str,
        content: &Value,
        priority: i64,
    ) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let content_json = serde_json::to_string(content)?;
        let now = now_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO print_jobs (id, printer_id, printer_address, printer_port,
                                         job_type, content, status, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
                params![job_id, printer_id, address, port, job_type, content_json, priority, now],
            )
            .map_err(sql("enqueue print job"))?;
            Ok(())
        })?;

        info!(job_id = %job_id, printer_id = %printer_id, job_type = %job_type,
              "Print job enqueued");
        Ok(job_id)
    }

    /// Jobs awaiting dispatch, highest priority first, FIFO within a tier.
    pub fn get_pending_jobs(&self, limit: usize) -> Result<Vec<PrintJob>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, printer_id, printer_address, printer_port, job_type, content,
                            status, priority, attempts, error_message, created_at, completed_at
                     FROM print_jobs
                     WHERE status = 'pending'
                     ORDER BY priority DESC, created_at ASC, rowid ASC
                     LIMIT ?1",
                )
                .map_err(sql("prepare get_pending_jobs"))?;
            let jobs = stmt
                .query_map(params![limit as i64], row_to_job)
                .map_err(sql("query get_pending_jobs"))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(jobs)
        })
    }

    /// Direct lookup by id.
    pub fn get_job(&self, job_id: &str) -> Result<Option<PrintJob>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, printer_id, printer_address, printer_port, job_type, content,
                        status, priority, attempts, error_message, created_at, completed_at
                 FROM print_jobs WHERE id = ?1",
                params![job_id],
                row_to_job,
            )
            .optional()
            .map_err(sql("get print job"))
        })
    }

    /// Jobs parked in `failed`, for the operator surface.
    pub fn failed_jobs(&self, limit: usize) -> Result<Vec<PrintJob>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, printer_id, printer_address, printer_port, job_type, content,
                            status, priority, attempts, error_message, created_at, completed_at
                     FROM print_jobs
                     WHERE status = 'failed'
                     ORDER BY created_at ASC
                     LIMIT ?1",
                )
                .map_err(sql("prepare failed_jobs"))?;
            let jobs = stmt
                .query_map(params![limit as i64], row_to_job)
                .map_err(sql("query failed_jobs"))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(jobs)
        })
    }

    /// Transition a job's status.
    ///
    /// `completed` stamps `completed_at`; `failed` increments `attempts`
    /// and stores the error message.
    pub fn update_status(
        &self,
        job_id: &str,
        status: PrintJobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        let affected = self.db.with_conn(|conn| {
            match status {
                PrintJobStatus::Completed => conn
                    .execute(
                        "UPDATE print_jobs
                         SET status = 'completed', completed_at = ?2, error_message = NULL
                         WHERE id = ?1",
                        params![job_id, now],
                    )
                    .map_err(sql("complete print job")),
                PrintJobStatus::Failed => conn
                    .execute(
                        "UPDATE print_jobs
                         SET status = 'failed',
                             attempts = attempts + 1,
                             error_message = COALESCE(?2, error_message)
                         WHERE id = ?1",
                        params![job_id, error],
                    )
                    .map_err(sql("fail print job")),
                _ => conn
                    .execute(
                        "UPDATE print_jobs SET status = ?2 WHERE id = ?1",
                        params![job_id, status.as_str()],
                    )
                    .map_err(sql("update print job status")),
            }
        })?;

        if affected == 0 {
            return Err(HostError::NotFound {
                kind: "print job",
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    /// Reset a failed job back to `pending`.
    ///
    /// Only while `attempts < 5`; past the cap the failure is terminal and
    /// needs operator action. Returns whether the job was re-queued.
    pub fn retry_job(&self, job_id: &str) -> Result<bool> {
        let affected = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE print_jobs
                 SET status = 'pending'
                 WHERE id = ?1 AND status = 'failed' AND attempts < ?2",
                params![job_id, PRINT_MAX_ATTEMPTS],
            )
            .map_err(sql("retry print job"))
        })?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------

    /// Run one spool cycle: dispatch pending jobs to their printers.
    ///
    /// Jobs are grouped by `printer_id`; each printer gets its own task that
    /// works strictly sequentially (at most one in-flight job per device, no
    /// output reordering) while different printers run concurrently. All
    /// printer tasks are joined before the cycle returns, so worker cycles
    /// never overlap. Returns the number of jobs printed.
    pub async fn run_print_cycle<T: PrintTransport>(
        &self,
        transport: &Arc<T>,
        cfg: &PrintWorkerConfig,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let jobs = self.get_pending_jobs(cfg.batch_limit)?;
        if jobs.is_empty() {
            return Ok(0);
        }

        // Group by printer, preserving the drain order within each group
        let mut by_printer: Vec<(String, Vec<PrintJob>)> = Vec::new();
        for job in jobs {
            match by_printer.iter_mut().find(|(id, _)| *id == job.printer_id) {
                Some((_, group)) => group.push(job),
                None => by_printer.push((job.printer_id.clone(), vec![job])),
            }
        }

        let mut handles = Vec::with_capacity(by_printer.len());
        for (printer_id, group) in by_printer {
            let queue = self.clone();
            let transport = Arc::clone(transport);
            let cfg = cfg.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut printed = 0usize;
                for job in group {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if queue.attempt_job(transport.as_ref(), &cfg, job).await {
                        printed += 1;
                    } else {
                        // The device is misbehaving; stop feeding it this
                        // cycle so jobs keep their relative order.
                        break;
                    }
                }
                (printer_id, printed)
            }));
        }

        let mut printed = 0usize;
        for handle in handles {
            match handle.await {
                Ok((printer_id, count)) => {
                    printed += count;
                    if count > 0 {
                        debug!(printer_id = %printer_id, count, "Printer drained");
                    }
                }
                Err(e) => error!("Printer task panicked: {e}"),
            }
        }
        Ok(printed)
    }

    /// Dispatch one job. Returns whether it printed.
    async fn attempt_job<T: PrintTransport>(
        &self,
        transport: &T,
        cfg: &PrintWorkerConfig,
        job: PrintJob,
    ) -> bool {
        let job_id = job.id.clone();
        let attempts_before = job.attempts;
        if let Err(e) = self.update_status(&job_id, PrintJobStatus::Printing, None) {
            warn!(job_id = %job_id, "Could not mark print job printing: {e}");
            return false;
        }

        let outcome = tokio::time::timeout(cfg.attempt_timeout, transport.print(job)).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(_) => Some(format!("print timed out after {:?}", cfg.attempt_timeout)),
        };

        match failure {
            None => {
                if let Err(e) = self.update_status(&job_id, PrintJobStatus::Completed, None) {
                    warn!(job_id = %job_id, "Could not mark print job completed: {e}");
                }
                debug!(job_id = %job_id, "Print job completed");
                true
            }
            Some(err) => {
                if let Err(e) = self.update_status(&job_id, PrintJobStatus::Failed, Some(&err)) {
                    warn!(job_id = %job_id, "Could not mark print job failed: {e}");
                    return false;
                }
                // Auto-requeue under the cap; terminal past it
                match self.retry_job(&job_id) {
                    Ok(true) => {
                        debug!(job_id = %job_id, error = %err, "Print failed; re-queued");
                    }
                    Ok(false) => {
                        warn!(job_id = %job_id, attempts = attempts_before + 1, error = %err,
                              "Print job failed terminally; operator action required");
                    }
                    Err(e) => warn!(job_id = %job_id, "Could not re-queue print job: {e}"),
                }
                false
            }
        }
    }

    /// Start the background print worker loop.
    ///
    /// Runs a cycle every `cfg.interval`; a cycle fully completes (all
    /// printer tasks joined) before the next starts.
    pub fn start_print_worker<T: PrintTransport>(
        &self,
        transport: Arc<T>,
        cfg: PrintWorkerConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = cfg.interval.as_secs(), "Print worker started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Print worker stopped");
                        break;
                    }
                    _ = tokio::time::sleep(cfg.interval) => {}
                }

                match queue.run_print_cycle(&transport, &cfg, &cancel).await {
                    Ok(printed) if printed > 0 => info!(printed, "Print cycle complete"),
                    Ok(_) => {}
                    Err(e) => error!("Print worker error: {e}"),
                }
            }
        })
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<PrintJob> {
    let status: String = row.get(6)?;
    Ok(PrintJob {
        id: row.get(0)?,
        printer_id: row.get(1)?,
        printer_address: row.get(2)?,
        printer_port: row.get(3)?,
        job_type: row.get(4)?,
        content: row.get(5)?,
        status: PrintJobStatus::parse(&status),
        priority: row.get(7)?,
        attempts: row.get(8)?,
        error_message: row.get(9)?,
        created_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn queue() -> PrintQueue {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        PrintQueue::new(Arc::new(DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }))
    }

    fn spool(queue: &PrintQueue, printer: &str, tag: &str, priority: i64) -> String {
        queue
            .add_print_job(
                printer,
                "10.0.0.5",
                9100,
                "kitchen_ticket",
                &serde_json::json!({ "tag": tag }),
                priority,
            )
            .expect("add job")
    }

    /// Transport that records dispatch order and fails on request.
    struct MockPrinter {
        fail_tags: Vec<String>,
        printed: Mutex<Vec<(String, String)>>,
    }

    impl MockPrinter {
        fn new() -> Self {
            Self {
                fail_tags: Vec::new(),
                printed: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(tag: &str) -> Self {
            Self {
                fail_tags: vec![tag.to_string()],
                printed: Mutex::new(Vec::new()),
            }
        }
    }

    impl PrintTransport for MockPrinter {
        fn print(
            &self,
            job: PrintJob,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send + '_>> {
            Box::pin(async move {
                let content: Value = serde_json::from_str(&job.content).expect("content json");
                let tag = content["tag"].as_str().unwrap_or_default().to_string();
                self.printed
                    .lock()
                    .expect("printed lock")
                    .push((job.printer_id.clone(), tag.clone()));
                if self.fail_tags.contains(&tag) {
                    Err(format!("printer jammed on {tag}"))
                } else {
                    Ok(())
                }
            })
        }
    }

    // ------------------------------------------------------------------
    // Queue semantics
    // ------------------------------------------------------------------

    #[test]
    fn test_add_and_fetch_pending_ordering() {
        let queue = queue();
        let low = spool(&queue, "pr-1", "low", 0);
        let high = spool(&queue, "pr-1", "high", 5);

        let pending = queue.get_pending_jobs(10).expect("pending");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, high, "higher priority first");
        assert_eq!(pending[1].id, low);
        assert_eq!(pending[0].status, PrintJobStatus::Pending);
        assert_eq!(pending[0].printer_port, 9100);
    }

    #[test]
    fn test_completed_stamps_completed_at() {
        let queue = queue();
        let id = spool(&queue, "pr-1", "receipt", 0);

        queue
            .update_status(&id, PrintJobStatus::Printing, None)
            .expect("printing");
        queue
            .update_status(&id, PrintJobStatus::Completed, None)
            .expect("completed");

        let job = queue.get_job(&id).expect("get").expect("job");
        assert_eq!(job.status, PrintJobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(queue.get_pending_jobs(10).expect("pending").is_empty());
    }

    #[test]
    fn test_failed_increments_attempts_and_stores_error() {
        let queue = queue();
        let id = spool(&queue, "pr-1", "receipt", 0);

        queue
            .update_status(&id, PrintJobStatus::Failed, Some("paper out"))
            .expect("failed");

        let job = queue.get_job(&id).expect("get").expect("job");
        assert_eq!(job.status, PrintJobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_message.as_deref(), Some("paper out"));

        let failed = queue.failed_jobs(10).expect("failed list");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id);
    }

    #[test]
    fn test_retry_caps_at_five_attempts() {
        let queue = queue();
        let id = spool(&queue, "pr-1", "receipt", 0);

        for round in 1..=5u32 {
            queue
                .update_status(&id, PrintJobStatus::Failed, Some("jam"))
                .expect("fail");
            let requeued = queue.retry_job(&id).expect("retry");
            if round < 5 {
                assert!(requeued, "attempt {round} should still re-queue");
            } else {
                assert!(!requeued, "fifth failure is terminal");
            }
        }

        let job = queue.get_job(&id).expect("get").expect("job");
        assert_eq!(job.status, PrintJobStatus::Failed);
        assert_eq!(job.attempts, 5);
    }

    #[test]
    fn test_update_status_unknown_job_is_not_found() {
        let queue = queue();
        let err = queue
            .update_status("pj-ghost", PrintJobStatus::Completed, None)
            .expect_err("unknown job");
        assert!(matches!(err, HostError::NotFound { .. }));
    }

    // ------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_print_cycle_preserves_per_printer_order() {
        let queue = queue();
        spool(&queue, "kitchen", "k1", 0);
        spool(&queue, "kitchen", "k2", 0);
        spool(&queue, "bar", "b1", 0);
        spool(&queue, "kitchen", "k3", 0);

        let transport = Arc::new(MockPrinter::new());
        let printed = queue
            .run_print_cycle(&transport, &PrintWorkerConfig::default(), &CancellationToken::new())
            .await
            .expect("cycle");
        assert_eq!(printed, 4);

        let log = transport.printed.lock().expect("log");
        let kitchen: Vec<&str> = log
            .iter()
            .filter(|(p, _)| p == "kitchen")
            .map(|(_, t)| t.as_str())
            .collect();
        assert_eq!(kitchen, vec!["k1", "k2", "k3"], "no reordering on one device");
        assert!(log.iter().any(|(p, _)| p == "bar"));

        assert!(queue.get_pending_jobs(10).expect("pending").is_empty());
    }

    #[tokio::test]
    async fn test_print_cycle_failure_requeues_and_stops_feeding_device() {
        let queue = queue();
        spool(&queue, "kitchen", "bad", 0);
        spool(&queue, "kitchen", "after", 0);

        let transport = Arc::new(MockPrinter::failing_on("bad"));
        let printed = queue
            .run_print_cycle(&transport, &PrintWorkerConfig::default(), &CancellationToken::new())
            .await
            .expect("cycle");
        assert_eq!(printed, 0, "device stops being fed after a failure");

        // The failed job went failed -> pending (auto-requeue) with one
        // attempt burned; the job behind it was never dispatched.
        let pending = queue.get_pending_jobs(10).expect("pending");
        assert_eq!(pending.len(), 2);
        let bad = pending
            .iter()
            .find(|j| j.content.contains("bad"))
            .expect("bad job");
        assert_eq!(bad.attempts, 1);
        assert!(bad.error_message.as_deref().expect("error").contains("jammed"));

        let log = transport.printed.lock().expect("log");
        assert_eq!(log.len(), 1, "job behind the failure not dispatched this cycle");
    }

    #[tokio::test]
    async fn test_print_cycle_next_round_retries() {
        let queue = queue();
        spool(&queue, "kitchen", "flaky", 0);

        let failing = Arc::new(MockPrinter::failing_on("flaky"));
        let cfg = PrintWorkerConfig::default();
        let cancel = CancellationToken::new();
        queue
            .run_print_cycle(&failing, &cfg, &cancel)
            .await
            .expect("first cycle");

        // Jam cleared: the re-queued job prints on the next cycle
        let healthy = Arc::new(MockPrinter::new());
        let printed = queue
            .run_print_cycle(&healthy, &cfg, &cancel)
            .await
            .expect("second cycle");
        assert_eq!(printed, 1);

        let jobs = queue.get_pending_jobs(10).expect("pending");
        assert!(jobs.is_empty());
    }
}

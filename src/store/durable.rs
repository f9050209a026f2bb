//! Durable task/report/log persistence backed by DuckDB.
//!
//! Architecture:
//! - `DurableStore` is the public handle, holding an `mpsc::SyncSender<DbCommand>`
//! - `DbWorker` runs on `std::thread::spawn` (DuckDB is sync) and owns the connection
//! - All writes are fire-and-forget upserts; a full channel drops the write
//!   with a warning rather than stalling a research run
//!
//! All code is gated with `#[cfg(feature = "durable-store")]` at the module level.

use std::path::PathBuf;
use std::sync::mpsc;

use duckdb::params;

/// Row shape for the `tasks` partition.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub task_id: String,
    pub kind: String,
    pub status: String,
    pub query: String,
    pub created_at: String,
    pub updated_at: String,
    pub error: Option<String>,
}

/// Row shape for the `reports` partition.
#[derive(Debug, Clone)]
pub struct ReportRow {
    pub task_id: String,
    pub report_md: String,
    pub summary_json: String,
    pub updated_at: String,
}

/// Row shape for the `logs` partition, keyed `(task_id, ts)`.
#[derive(Debug, Clone)]
pub struct LogRow {
    pub task_id: String,
    pub ts: String,
    pub event_type: String,
    pub message: String,
}

enum DbCommand {
    UpsertTask(TaskRow),
    UpsertReport(ReportRow),
    AppendLog(LogRow),
    Shutdown,
}

/// Non-blocking handle for the durable store worker.
pub struct DurableStore {
    tx: mpsc::SyncSender<DbCommand>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
}

impl DurableStore {
    /// Open (or create) the database and spawn the worker thread.
    /// Returns `None` if the directory or connection cannot be set up.
    pub fn open(db_path: PathBuf) -> Option<Self> {
        if let Some(parent) = db_path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!("durable store: cannot create db dir: {e}");
            return None;
        }

        // Bounded channel: a slow or stuck worker must not buffer unboundedly.
        let (tx, rx) = mpsc::sync_channel(256);

        let builder = std::thread::Builder::new().name("aletheia-durable-db".into());
        let handle = match builder.spawn(move || DbWorker::run(rx, db_path)) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!("durable store: failed to spawn worker thread: {e}");
                return None;
            }
        };

        Some(Self {
            tx,
            worker_handle: Some(handle),
        })
    }

    pub fn upsert_task(&self, row: TaskRow) {
        if let Err(e) = self.tx.try_send(DbCommand::UpsertTask(row)) {
            tracing::warn!("durable store: dropped task upsert: {e}");
        }
    }

    pub fn upsert_report(&self, row: ReportRow) {
        if let Err(e) = self.tx.try_send(DbCommand::UpsertReport(row)) {
            tracing::warn!("durable store: dropped report upsert: {e}");
        }
    }

    pub fn append_log(&self, row: LogRow) {
        if let Err(e) = self.tx.try_send(DbCommand::AppendLog(row)) {
            tracing::warn!("durable store: dropped log row: {e}");
        }
    }
}

impl Drop for DurableStore {
    fn drop(&mut self) {
        let _ = self.tx.send(DbCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").finish()
    }
}

// ---------------------------------------------------------------------------
// Background worker
// ---------------------------------------------------------------------------

struct DbWorker {
    rx: mpsc::Receiver<DbCommand>,
    db_path: PathBuf,
    /// Opened lazily on the first command.
    conn: Option<duckdb::Connection>,
}

impl DbWorker {
    fn run(rx: mpsc::Receiver<DbCommand>, db_path: PathBuf) {
        let mut worker = DbWorker {
            rx,
            db_path,
            conn: None,
        };

        loop {
            match worker.rx.recv() {
                Ok(DbCommand::UpsertTask(row)) => worker.handle_upsert_task(&row),
                Ok(DbCommand::UpsertReport(row)) => worker.handle_upsert_report(&row),
                Ok(DbCommand::AppendLog(row)) => worker.handle_append_log(&row),
                Ok(DbCommand::Shutdown) => {
                    tracing::debug!("durable store: worker shutting down");
                    break;
                }
                Err(_) => {
                    tracing::debug!("durable store: channel closed, worker exiting");
                    break;
                }
            }
        }
    }

    fn ensure_connection(&mut self) -> bool {
        if self.conn.is_some() {
            return true;
        }

        match duckdb::Connection::open(&self.db_path) {
            Ok(conn) => {
                if let Err(e) = apply_migrations(&conn) {
                    tracing::warn!("durable store: migration failed: {e}");
                    return false;
                }
                self.conn = Some(conn);
                true
            }
            Err(e) => {
                tracing::warn!("durable store: failed to open DuckDB: {e}");
                false
            }
        }
    }

    fn handle_upsert_task(&mut self, row: &TaskRow) {
        if !self.ensure_connection() {
            return;
        }
        let Some(conn) = self.conn.as_ref() else { return };

        if let Err(e) = conn.execute(
            "INSERT INTO tasks (task_id, kind, status, query, created_at, updated_at, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT (task_id) DO UPDATE SET \
             status = EXCLUDED.status, updated_at = EXCLUDED.updated_at, \
             error = EXCLUDED.error",
            params![
                row.task_id,
                row.kind,
                row.status,
                row.query,
                row.created_at,
                row.updated_at,
                row.error,
            ],
        ) {
            tracing::warn!("durable store: task upsert failed: {e}");
        }
    }

    fn handle_upsert_report(&mut self, row: &ReportRow) {
        if !self.ensure_connection() {
            return;
        }
        let Some(conn) = self.conn.as_ref() else { return };

        if let Err(e) = conn.execute(
            "INSERT INTO reports (task_id, report_md, summary_json, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (task_id) DO UPDATE SET \
             report_md = EXCLUDED.report_md, summary_json = EXCLUDED.summary_json, \
             updated_at = EXCLUDED.updated_at",
            params![row.task_id, row.report_md, row.summary_json, row.updated_at],
        ) {
            tracing::warn!("durable store: report upsert failed: {e}");
        }
    }

    fn handle_append_log(&mut self, row: &LogRow) {
        if !self.ensure_connection() {
            return;
        }
        let Some(conn) = self.conn.as_ref() else { return };

        if let Err(e) = conn.execute(
            "INSERT INTO logs (task_id, ts, event_type, message) VALUES (?1, ?2, ?3, ?4)",
            params![row.task_id, row.ts, row.event_type, row.message],
        ) {
            tracing::warn!("durable store: log insert failed: {e}");
        }
    }
}

fn apply_migrations(conn: &duckdb::Connection) -> Result<(), duckdb::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
            task_id VARCHAR PRIMARY KEY,
            kind VARCHAR NOT NULL,
            status VARCHAR NOT NULL,
            query VARCHAR NOT NULL,
            created_at VARCHAR NOT NULL,
            updated_at VARCHAR NOT NULL,
            error VARCHAR
        );
        CREATE TABLE IF NOT EXISTS reports (
            task_id VARCHAR PRIMARY KEY,
            report_md VARCHAR NOT NULL,
            summary_json VARCHAR NOT NULL,
            updated_at VARCHAR NOT NULL
        );
        CREATE TABLE IF NOT EXISTS logs (
            task_id VARCHAR NOT NULL,
            ts VARCHAR NOT NULL,
            event_type VARCHAR NOT NULL,
            message VARCHAR NOT NULL
        );",
    )
}

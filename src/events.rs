//! Event log sink: append-only NDJSON frames, one per progress event.
//!
//! The sink is injected into the orchestrator alongside the progress bus so
//! cross-cutting event logging stays out of the control loop. Writes go
//! through a background thread (file I/O off the async runtime); a full
//! channel drops the frame with a warning rather than stalling the run.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::progress::ProgressEvent;

/// Injected event logging interface.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Sink that discards everything. Used in tests and when no artifacts
/// directory is configured.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

enum LogCommand {
    Line(String),
    Shutdown,
}

/// NDJSON event log at `${artifacts_dir}/events_<session>_<epoch>.ndjson`.
pub struct NdjsonEventLog {
    tx: mpsc::SyncSender<LogCommand>,
    path: PathBuf,
    worker_handle: Option<std::thread::JoinHandle<()>>,
}

impl NdjsonEventLog {
    /// Create the log file and spawn the writer thread. Returns `None` when
    /// the directory or file cannot be created (logged, not fatal).
    pub fn create(artifacts_dir: &Path, session: &str) -> Option<Self> {
        if let Err(e) = std::fs::create_dir_all(artifacts_dir) {
            tracing::warn!("event log: cannot create artifacts dir: {e}");
            return None;
        }

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let safe_session = sanitize_session(session);
        let path = artifacts_dir.join(format!("events_{safe_session}_{epoch}.ndjson"));

        let file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("event log: cannot open {}: {e}", path.display());
                return None;
            }
        };

        let (tx, rx) = mpsc::sync_channel::<LogCommand>(256);
        let builder = std::thread::Builder::new().name("aletheia-event-log".into());
        let handle = match builder.spawn(move || writer_loop(rx, file)) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!("event log: failed to spawn writer thread: {e}");
                return None;
            }
        };

        Some(Self {
            tx,
            path,
            worker_handle: Some(handle),
        })
    }

    /// Path of the log file (for diagnostics and tests).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for NdjsonEventLog {
    fn emit(&self, event: &ProgressEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("event log: serialisation failed: {e}");
                return;
            }
        };
        if self.tx.try_send(LogCommand::Line(line)).is_err() {
            tracing::warn!(task_id = event.task_id, "event log: dropped frame");
        }
    }
}

impl Drop for NdjsonEventLog {
    fn drop(&mut self) {
        let _ = self.tx.send(LogCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for NdjsonEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdjsonEventLog")
            .field("path", &self.path)
            .finish()
    }
}

fn writer_loop(rx: mpsc::Receiver<LogCommand>, file: std::fs::File) {
    let mut writer = std::io::BufWriter::new(file);
    loop {
        match rx.recv() {
            Ok(LogCommand::Line(line)) => {
                if writeln!(writer, "{line}").and_then(|()| writer.flush()).is_err() {
                    tracing::warn!("event log: write failed, frame lost");
                }
            }
            Ok(LogCommand::Shutdown) | Err(_) => {
                let _ = writer.flush();
                break;
            }
        }
    }
}

fn sanitize_session(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::EventKind;

    fn temp_dir(name: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir()
            .join("aletheia-events-test")
            .join(format!("{name}_{}_{ts}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn frames_append_one_per_line() {
        let dir = temp_dir("append");
        let path;
        {
            let log = NdjsonEventLog::create(&dir, "session-1").unwrap();
            path = log.path().to_path_buf();
            for i in 0..3 {
                log.emit(&ProgressEvent::new(
                    "task_1",
                    EventKind::Evidence,
                    format!("event {i}"),
                ));
            }
            // Drop joins the writer thread, flushing all frames.
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for (i, line) in lines.iter().enumerate() {
            let frame: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(frame["task_id"], "task_1");
            assert_eq!(frame["event_type"], "evidence");
            assert_eq!(frame["message"], format!("event {i}"));
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn filename_carries_session_and_epoch() {
        let dir = temp_dir("filename");
        let log = NdjsonEventLog::create(&dir, "deep/research 1").unwrap();
        let name = log.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("events_deep_research_1_"));
        assert!(name.ends_with(".ndjson"));
        drop(log);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

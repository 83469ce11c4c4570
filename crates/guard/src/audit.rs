//! Append-only security audit trail.
//!
//! Every security-relevant decision (login outcome, lockout, traversal
//! attempt, CSRF failure, upload/delete result) produces one [`AuditRecord`].
//! Sinks are best-effort: a failing sink logs through `tracing` and returns,
//! it never fails the request that produced the record.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// File name of the audit log inside the audit directory.
pub const AUDIT_LOG_FILE: &str = "audit.log";

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Event name, e.g. `login_failed`.
    pub event: String,
    /// Client address as reported by the transport.
    pub source: String,
    /// Free-form structured context.
    pub context: Value,
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    /// Persist a record. Must not panic and must not block indefinitely.
    fn record(&self, record: &AuditRecord);
}

/// Newline-delimited JSON audit log on disk.
///
/// Writes go through a process-wide lock and an `O_APPEND` handle so lines
/// from concurrent requests never interleave.
pub struct FileAuditLog {
    /// Directory holding the log file.
    dir: PathBuf,
    /// Full path of the log file.
    path: PathBuf,
    /// Serializes appends within this process.
    write_lock: Mutex<()>,
}

impl FileAuditLog {
    /// Create an audit log writing into `dir/audit.log`.
    ///
    /// The directory is created lazily on first write.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(AUDIT_LOG_FILE);
        Self {
            dir,
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Directory holding the log.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| std::io::Error::other("audit log lock poisoned"))?;

        fs::create_dir_all(&self.dir)?;

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        // One write per record so concurrent appenders never split a line.
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');

        let mut file = options.open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        Ok(())
    }
}

impl AuditSink for FileAuditLog {
    fn record(&self, record: &AuditRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, event = %record.event, "Failed to serialize audit record");
                return;
            }
        };

        if let Err(e) = self.append(&line) {
            warn!(
                path = ?self.path,
                error = %e,
                event = %record.event,
                "Failed to write audit record"
            );
        }
    }
}

/// In-memory sink, used by tests and by embedders that ship records elsewhere.
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Names of all events so far, in order.
    pub fn events(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    /// Whether an event with this name was recorded.
    pub fn contains(&self, event: &str) -> bool {
        self.records().iter().any(|r| r.event == event)
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, record: &AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Request-scoped handle that stamps records with the client address.
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
    source: String,
}

impl Auditor {
    /// Bind a sink to one client address.
    pub fn new(sink: Arc<dyn AuditSink>, source: impl Into<String>) -> Self {
        Self {
            sink,
            source: source.into(),
        }
    }

    /// Client address this auditor stamps on records.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Record an event with structured context.
    pub fn event(&self, event: &str, context: Value) {
        info!(
            target: "audit",
            event_type = event,
            source = %self.source,
            context = %context,
            "Audit event"
        );

        let record = AuditRecord {
            timestamp: Utc::now(),
            event: event.to_string(),
            source: self.source.clone(),
            context,
        };
        self.sink.record(&record);
    }
}

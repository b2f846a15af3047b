use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::{AuditEvent, AuditSink};

/// One JSON object per line in `<dir>/audit.jsonl`.
pub struct JsonlAuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            path: log_dir.join("audit.jsonl"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &AuditEvent) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create audit log directory")?;
        }
        let mut line = serde_json::to_string(event).context("Failed to serialize audit event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open audit log")?;
        file.write_all(line.as_bytes())
            .context("Failed to append audit event")?;
        Ok(())
    }

    /// The last `limit` events, oldest first. Unparsable lines are skipped.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
        let events: Vec<AuditEvent> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let skip = events.len().saturating_sub(limit);
        Ok(events.into_iter().skip(skip).collect())
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.append(&event) {
            tracing::warn!(kind = %event.kind, error = %e, "failed to write audit event");
        }
    }

    fn last_for_issue(&self, project: &str, issue_id: u64, kind: &str) -> Option<AuditEvent> {
        let content = fs::read_to_string(&self.path).ok()?;
        content
            .lines()
            .rev()
            .filter_map(|l| serde_json::from_str::<AuditEvent>(l).ok())
            .find(|e| e.matches(project, issue_id, kind))
    }
}

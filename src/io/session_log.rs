//! Session log - writes completed occupied sessions to file
//!
//! Sessions are written in JSONL format (one JSON object per line). Tick
//! times are epoch milliseconds in the service, so start/end are also
//! rendered as RFC 3339 UTC.

use crate::domain::types::CompletedSession;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};
use uuid::Uuid;

/// One line of the session log
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    /// Session id (UUIDv7, time-sortable)
    pub sid: String,
    pub site: String,
    pub started_at: String,
    pub ended_at: String,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub duration_ms: u64,
    pub peak_occupants: u32,
    pub entries: u32,
}

fn rfc3339(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

impl SessionRecord {
    pub fn new(site: &str, session: &CompletedSession) -> Self {
        Self {
            sid: Uuid::now_v7().to_string(),
            site: site.to_string(),
            started_at: rfc3339(session.started_at_ms),
            ended_at: rfc3339(session.ended_at_ms),
            started_at_ms: session.started_at_ms,
            ended_at_ms: session.ended_at_ms,
            duration_ms: session.duration_ms,
            peak_occupants: session.peak_occupants,
            entries: session.entries,
        }
    }
}

pub struct SessionLog {
    file_path: String,
    site: String,
}

impl SessionLog {
    pub fn new(file_path: &str, site: &str) -> Self {
        info!(file_path = %file_path, "session_log_initialized");
        Self { file_path: file_path.to_string(), site: site.to_string() }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Append a session. Failures are logged, never propagated.
    /// Returns the record that was written.
    pub fn write_session(&self, session: &CompletedSession) -> Option<SessionRecord> {
        let record = SessionRecord::new(&self.site, session);

        let result = serde_json::to_string(&record)
            .map_err(std::io::Error::other)
            .and_then(|json| self.append_line(&json));

        match result {
            Ok(()) => {
                debug!(sid = %record.sid, duration_ms = %record.duration_ms, "session_logged");
                Some(record)
            }
            Err(e) => {
                error!(file = %self.file_path, error = %e, "session_log_failed");
                None
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)
    }
}

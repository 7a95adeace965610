//! Append-only JSONL provenance event log.

use crate::core::error::Result;
use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current UTC time as RFC 3339 with second precision.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default() as u64;
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path for a stack.
pub fn event_log_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join("events.jsonl")
}

/// Append an event to the stack's event log.
pub fn append_event(state_dir: &Path, stack: &str, event: ProvenanceEvent) -> Result<()> {
    let path = event_log_path(state_dir, stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{}", json)?;

    Ok(())
}

/// Read every event of a stack's log. A missing log yields no events.
pub fn read_events(state_dir: &Path, stack: &str) -> Result<Vec<TimestampedEvent>> {
    let path = event_log_path(state_dir, stack);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}

/// Event sink handed to the executor; disabled sinks drop events.
#[derive(Debug, Clone)]
pub struct EventLog {
    state_dir: Option<PathBuf>,
    stack: String,
}

impl EventLog {
    pub fn new(state_dir: impl Into<PathBuf>, stack: impl Into<String>) -> Self {
        Self {
            state_dir: Some(state_dir.into()),
            stack: stack.into(),
        }
    }

    pub fn disabled(stack: impl Into<String>) -> Self {
        Self {
            state_dir: None,
            stack: stack.into(),
        }
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Append an event; failures are logged, never propagated.
    pub fn record(&self, event: ProvenanceEvent) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        if let Err(e) = append_event(dir, &self.stack, event) {
            tracing::warn!(stack = %self.stack, error = %e, "cannot append provenance event");
        }
    }
}

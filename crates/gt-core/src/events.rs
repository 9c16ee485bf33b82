use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// FeedEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedEventKind {
    Sling,
    SchedulerEnqueue,
    LifecycleShutdown,
}

/// One record in the loss-tolerant event feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEvent {
    pub id: Uuid,
    pub kind: FeedEventKind,
    /// Who performed the action (caller context, e.g. `cli` or
    /// `queue-dispatch`).
    pub actor: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl FeedEvent {
    pub fn new(kind: FeedEventKind, actor: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            actor: actor.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventFeed
// ---------------------------------------------------------------------------

/// Appends typed records to `<town root>/.gastown/events.jsonl`.
///
/// Emission is best-effort and loss-tolerant: failures are logged and never
/// surfaced to the caller, and there is no back-pressure.
#[derive(Debug, Clone)]
pub struct EventFeed {
    path: PathBuf,
}

impl EventFeed {
    pub fn new(town_root: &Path) -> Self {
        Self {
            path: town_root.join(".gastown").join("events.jsonl"),
        }
    }

    pub fn emit(&self, event: FeedEvent) {
        if let Err(e) = self.try_emit(&event) {
            warn!(kind = ?event.kind, error = %e, "event feed write dropped");
        }
    }

    fn try_emit(&self, event: &FeedEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{line}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

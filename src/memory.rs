//! Conversation memory: completed turns recorded for later recall
//!
//! Recording is fire-and-forget; a sink that fails must never stall or
//! abort the live conversation.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::upstream::TranscriptRole;

/// One completed conversational turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Who spoke
    pub role: String,
    /// Full transcript of the turn
    pub content: String,
    /// When the turn completed
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Create a turn completed now
    #[must_use]
    pub fn new(role: TranscriptRole, content: String) -> Self {
        Self {
            role: role.as_str().to_string(),
            content,
            timestamp: Utc::now(),
        }
    }
}

/// Receives completed turns
pub trait MemorySink: Send + Sync {
    /// Record a turn. Must not block the caller for long and must not
    /// surface errors beyond logging.
    fn record(&self, turn: Turn);
}

/// Sink that writes turns to the log only
#[derive(Debug, Default)]
pub struct LogSink;

impl MemorySink for LogSink {
    fn record(&self, turn: Turn) {
        tracing::info!(role = %turn.role, content = %turn.content, "turn recorded");
    }
}

/// Sink that appends turns as JSON lines under the data directory
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl JsonlSink {
    /// Create a sink appending to `transcript.jsonl` in `data_dir`
    #[must_use]
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            path: data_dir.join("transcript.jsonl"),
            file: Mutex::new(None),
        }
    }
}

impl MemorySink for JsonlSink {
    fn record(&self, turn: Turn) {
        let Ok(mut slot) = self.file.lock() else {
            return;
        };
        if slot.is_none() {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
            {
                Ok(file) => *slot = Some(file),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "failed to open transcript file"
                    );
                    return;
                }
            }
        }
        let Some(file) = slot.as_mut() else { return };
        match serde_json::to_string(&turn) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    tracing::warn!(error = %e, "failed to append transcript line");
                    *slot = None;
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize turn"),
        }
    }
}

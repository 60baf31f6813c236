//! Bounded in-memory ring of recent diagnostic entries.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

/// Maximum entries kept.
pub const MAX_ISSUE_LOG_ENTRIES: usize = 100;

/// Appends beyond this overshoot trigger a batch trim back to the maximum.
const TRIM_SLACK: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssueEntry {
    pub ts: String,
    pub severity: Severity,
    pub message: String,
}

/// Recent diagnostics, oldest first.
#[derive(Default)]
pub struct IssueLog {
    entries: Mutex<VecDeque<IssueEntry>>,
}

impl IssueLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, severity: Severity, message: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(IssueEntry {
            ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            severity,
            message: message.into(),
        });
        if entries.len() > MAX_ISSUE_LOG_ENTRIES + TRIM_SLACK {
            while entries.len() > MAX_ISSUE_LOG_ENTRIES {
                entries.pop_front();
            }
        }
    }

    /// Current contents, capped at [`MAX_ISSUE_LOG_ENTRIES`].
    pub fn entries(&self) -> Vec<IssueEntry> {
        let mut entries = self.entries.lock().unwrap();
        while entries.len() > MAX_ISSUE_LOG_ENTRIES {
            entries.pop_front();
        }
        entries.iter().cloned().collect()
    }
}

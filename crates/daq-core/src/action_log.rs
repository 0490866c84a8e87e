//! Timestamped history of instrument actions.
//!
//! Every operation on a device ends in an [`ActionOutcome`]. The outcome is
//! appended to the device's [`ActionLog`], becomes its "last action" string,
//! and is mirrored to `tracing` (info on success, warn on failure). A device
//! and its controller share one log by cloning the handle.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

const MAX_LOG_ENTRIES: usize = 1000;

/// Result of one contained instrument operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    /// Whether the instrument did what was asked.
    pub ok: bool,
    /// Human-readable status, e.g. "Position moved to: 12.5".
    pub message: String,
}

impl ActionOutcome {
    /// Successful outcome.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    /// Failed outcome.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }

    /// Convert into a `Result`, turning a failure into an `anyhow` error with
    /// the status message.
    pub fn into_result(self) -> anyhow::Result<String> {
        if self.ok {
            Ok(self.message)
        } else {
            Err(anyhow::anyhow!(self.message))
        }
    }
}

/// A single log entry.
#[derive(Debug, Clone, Serialize)]
pub struct ActionEntry {
    /// When the action finished.
    pub timestamp: DateTime<Local>,
    /// Which device or component produced it.
    pub source: String,
    /// Whether it succeeded.
    pub ok: bool,
    /// Status message.
    pub message: String,
}

impl std::fmt::Display for ActionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.source,
            if self.ok { "" } else { "FAILED: " },
            self.message
        )
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<ActionEntry>,
    last_action: String,
}

/// A thread-safe, fixed-capacity action history.
#[derive(Debug, Clone)]
pub struct ActionLog {
    source: Arc<str>,
    inner: Arc<Mutex<Inner>>,
}

impl ActionLog {
    /// Empty log for `source`.
    pub fn new(source: impl Into<String>) -> Self {
        let source: String = source.into();
        Self {
            source: source.into(),
            inner: Arc::new(Mutex::new(Inner {
                entries: VecDeque::with_capacity(64),
                last_action: String::new(),
            })),
        }
    }

    /// Name used for entries and log lines.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Record an outcome and hand it back.
    pub fn record(&self, outcome: ActionOutcome) -> ActionOutcome {
        if outcome.ok {
            tracing::info!(source = %self.source, "{}", outcome.message);
        } else {
            tracing::warn!(source = %self.source, "{}", outcome.message);
        }

        let mut inner = self.inner.lock();
        if inner.entries.len() >= MAX_LOG_ENTRIES {
            inner.entries.pop_front();
        }
        inner.entries.push_back(ActionEntry {
            timestamp: Local::now(),
            source: self.source.to_string(),
            ok: outcome.ok,
            message: outcome.message.clone(),
        });
        inner.last_action = outcome.message.clone();
        outcome
    }

    /// Shorthand for recording a successful outcome.
    pub fn success(&self, message: impl Into<String>) -> ActionOutcome {
        self.record(ActionOutcome::success(message))
    }

    /// Shorthand for recording a failed outcome.
    pub fn failure(&self, message: impl Into<String>) -> ActionOutcome {
        self.record(ActionOutcome::failure(message))
    }

    /// Most recent status string (empty before the first action).
    pub fn last_action(&self) -> String {
        self.inner.lock().last_action.clone()
    }

    /// Copy of every retained entry, oldest first.
    pub fn entries(&self) -> Vec<ActionEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_updates_last_action() {
        let log = ActionLog::new("Delay stage");
        log.success("Entered READY state");
        log.failure("Position not moved! Command Error: Displacement out of limits.");

        assert_eq!(log.len(), 2);
        assert_eq!(
            log.last_action(),
            "Position not moved! Command Error: Displacement out of limits."
        );
        let entries = log.entries();
        assert!(entries[0].ok);
        assert!(!entries[1].ok);
    }

    #[test]
    fn clones_share_history() {
        let log = ActionLog::new("Laser");
        let shared = log.clone();
        shared.success("Main shutter opened.");
        assert_eq!(log.last_action(), "Main shutter opened.");
    }

    #[test]
    fn history_is_bounded() {
        let log = ActionLog::new("Laser");
        for i in 0..(MAX_LOG_ENTRIES + 5) {
            log.success(format!("entry {i}"));
        }
        assert_eq!(log.len(), MAX_LOG_ENTRIES);
        assert_eq!(log.entries()[0].message, "entry 5");
    }

    #[test]
    fn failed_outcome_becomes_error() {
        let err = ActionOutcome::failure("Wavelength not changed. Invalid wavelength.")
            .into_result()
            .unwrap_err();
        assert_eq!(err.to_string(), "Wavelength not changed. Invalid wavelength.");
    }
}

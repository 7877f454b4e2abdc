//! Instance health tracking
//!
//! Each running instance owns an [`InstanceHealth`] shared with its router
//! and its background task:
//! - lifecycle state (`starting`, `healthy`, `failed`, `stopped`)
//! - the most recent error message
//! - a bounded, timestamped error log

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::warn;

/// Maximum retained error log entries
pub const MAX_LOG_ENTRIES: usize = 100;

/// Lifecycle state of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Healthy,
    /// Carries the captured error text
    Failed(String),
    Stopped,
}

impl InstanceState {
    pub fn label(&self) -> &'static str {
        match self {
            InstanceState::Starting => "starting",
            InstanceState::Healthy => "healthy",
            InstanceState::Failed(_) => "failed",
            InstanceState::Stopped => "stopped",
        }
    }

    /// Failed or stopped; the instance will not serve requests again
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Failed(_) | InstanceState::Stopped)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single error log entry
#[derive(Debug, Clone)]
struct ErrorLogEntry {
    timestamp: DateTime<Utc>,
    operation: String,
    path: String,
    error: String,
}

impl ErrorLogEntry {
    fn format(&self) -> String {
        format!(
            "[{}] {} {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f UTC"),
            self.operation,
            self.path,
            self.error
        )
    }
}

struct HealthState {
    state: InstanceState,
    last_error: Option<String>,
}

/// Shared health object for one instance
pub struct InstanceHealth {
    state: RwLock<HealthState>,
    error_log: Mutex<VecDeque<ErrorLogEntry>>,
}

impl Default for InstanceHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceHealth {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HealthState {
                state: InstanceState::Starting,
                last_error: None,
            }),
            error_log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state.read().state.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    pub fn mark_healthy(&self) {
        let mut state = self.state.write();
        if !state.state.is_terminal() {
            state.state = InstanceState::Healthy;
        }
    }

    /// Record a fatal error; the instance is considered dead afterwards
    pub fn mark_failed(&self, error: impl Into<String>) {
        let error = error.into();
        self.push_log("instance", "/", &error);
        let mut state = self.state.write();
        state.last_error = Some(error.clone());
        state.state = InstanceState::Failed(error);
    }

    /// Clean stop; an earlier failure is kept
    pub fn mark_stopped(&self) {
        let mut state = self.state.write();
        if !matches!(state.state, InstanceState::Failed(_)) {
            state.state = InstanceState::Stopped;
        }
    }

    /// Log a non-fatal operation error
    pub fn record_error(&self, operation: &str, path: &str, error: impl fmt::Display) {
        let error = error.to_string();
        warn!("Instance error in {} on {}: {}", operation, path, error);
        self.push_log(operation, path, &error);
        self.state.write().last_error = Some(error);
    }

    /// Formatted error log, oldest first
    pub fn recent_errors(&self) -> Vec<String> {
        self.error_log.lock().iter().map(|e| e.format()).collect()
    }

    fn push_log(&self, operation: &str, path: &str, error: &str) {
        let mut log = self.error_log.lock();
        log.push_back(ErrorLogEntry {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            path: path.to_string(),
            error: error.to_string(),
        });
        while log.len() > MAX_LOG_ENTRIES {
            log.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let health = InstanceHealth::new();
        assert_eq!(health.state(), InstanceState::Starting);

        health.mark_healthy();
        assert_eq!(health.state().label(), "healthy");

        health.mark_stopped();
        assert!(health.state().is_terminal());

        health.mark_healthy();
        assert_eq!(health.state(), InstanceState::Stopped);
    }

    #[test]
    fn test_failure_survives_stop() {
        let health = InstanceHealth::new();
        health.mark_failed("connection refused");
        health.mark_stopped();

        assert_eq!(
            health.state(),
            InstanceState::Failed("connection refused".into())
        );
        assert_eq!(health.last_error().as_deref(), Some("connection refused"));
        assert_eq!(health.recent_errors().len(), 1);
    }

    #[test]
    fn test_record_error_keeps_state() {
        let health = InstanceHealth::new();
        health.mark_healthy();
        health.record_error("write", "/a.txt", "broken pipe");

        assert_eq!(health.state(), InstanceState::Healthy);
        assert_eq!(health.last_error().as_deref(), Some("broken pipe"));
        let log = health.recent_errors();
        assert!(log[0].contains("write /a.txt: broken pipe"));
    }

    #[test]
    fn test_error_log_max_entries() {
        let health = InstanceHealth::new();
        for i in 0..(MAX_LOG_ENTRIES + 10) {
            health.record_error("read", &format!("/f{}", i), "eof");
        }

        let log = health.recent_errors();
        assert_eq!(log.len(), MAX_LOG_ENTRIES);
        assert!(log[0].contains("/f10:"));
    }
}

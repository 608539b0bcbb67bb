//! Master lifecycle state and the published registration record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a master orchestrator instance.
///
/// ```text
/// Initializing --lock acquired--> Running --stop | lock lost--> ShuttingDown --> Stopped
///      \--------------------- lock held elsewhere ------------------------------^
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl MasterState {
    /// Returns whether moving from `self` to `to` is a legal transition.
    pub fn can_transition(self, to: MasterState) -> bool {
        use MasterState::*;
        matches!(
            (self, to),
            (Initializing, Running)
                | (Initializing, Stopped)
                | (Running, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterState::Initializing => write!(f, "initializing"),
            MasterState::Running => write!(f, "running"),
            MasterState::ShuttingDown => write!(f, "shutting_down"),
            MasterState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why the control loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Another master holds the lock; this instance never ran.
    NotElected,
    /// A `stop` command was received.
    StopCommand,
    /// The process was asked to stop (signal or cancellation).
    Cancelled,
    /// Renewal failed; the instance abdicated.
    LockLost,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::NotElected => write!(f, "another master is active"),
            ExitReason::StopCommand => write!(f, "stop command"),
            ExitReason::Cancelled => write!(f, "shutdown signal"),
            ExitReason::LockLost => write!(f, "master lock lost"),
        }
    }
}

/// Read-only status record published by the current master.
///
/// Dashboards read it; the master lock, not this record, decides who is master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRegistration {
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub state: MasterState,
}

impl MasterRegistration {
    /// Creates a registration for this process.
    pub fn new(hostname: impl Into<String>, started_at: DateTime<Utc>, state: MasterState) -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname.into(),
            started_at,
            last_update: Utc::now(),
            state,
        }
    }

    /// Returns true when the record has not been refreshed within `max_age`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> bool {
        (now - self.last_update)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use MasterState::*;
        assert!(Initializing.can_transition(Running));
        assert!(Initializing.can_transition(Stopped));
        assert!(Running.can_transition(ShuttingDown));
        assert!(ShuttingDown.can_transition(Stopped));

        assert!(!Running.can_transition(Stopped));
        assert!(!Stopped.can_transition(Running));
        assert!(!ShuttingDown.can_transition(Running));
        assert!(!Initializing.can_transition(ShuttingDown));
    }

    #[test]
    fn test_registration_staleness() {
        let now = Utc::now();
        let mut reg = MasterRegistration::new("host-a", now, MasterState::Running);
        reg.last_update = now - chrono::Duration::seconds(90);

        assert!(reg.is_stale(now, std::time::Duration::from_secs(60)));
        assert!(!reg.is_stale(now, std::time::Duration::from_secs(120)));
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&MasterState::ShuttingDown).expect("serialize");
        assert_eq!(json, "\"shutting_down\"");
    }
}

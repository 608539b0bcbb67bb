//! Mirrored activity log.
//!
//! Lines are emitted through `tracing` and also appended to the shared store
//! as `[timestamp] [component] [LEVEL] message`, with the newest line kept
//! under its own key for dashboards that only poll the latest entry.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => write!(f, "INFO"),
            Level::Warn => write!(f, "WARNING"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

/// Writes operator-facing events to the log mirror.
pub struct ActivityLog {
    store: Arc<dyn StateStore>,
    component: String,
    history: usize,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn StateStore>, component: impl Into<String>, history: usize) -> Self {
        Self {
            store,
            component: component.into(),
            history: history.max(1),
        }
    }

    /// Number of lines kept in the mirrored list.
    pub fn set_history(&mut self, history: usize) {
        self.history = history.max(1);
    }

    /// Formats one line in the mirror format.
    pub fn format_line(&self, level: Level, message: &str) -> String {
        format!(
            "[{}] [{}] [{}] {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            self.component,
            level,
            message
        )
    }

    pub async fn record(&self, level: Level, message: &str) {
        match level {
            Level::Info => info!(component = %self.component, "{}", message),
            Level::Warn => warn!(component = %self.component, "{}", message),
            Level::Error => error!(component = %self.component, "{}", message),
        }

        let line = self.format_line(level, message);
        if let Err(e) = self.store.append_log(&line, self.history).await {
            debug!(error = %e, "Failed to mirror log line");
        }
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.record(Level::Info, message.as_ref()).await;
    }

    pub async fn warn(&self, message: impl AsRef<str>) {
        self.record(Level::Warn, message.as_ref()).await;
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.record(Level::Error, message.as_ref()).await;
    }
}

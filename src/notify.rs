use std::fmt;
use std::sync::Mutex;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Level> {
        match value {
            "info" => Some(Level::Info),
            "warning" => Some(Level::Warning),
            "error" => Some(Level::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: Level,
    pub message: String,
    pub raised_at: NaiveDateTime,
}

pub trait Notifier {
    fn notify(&self, level: Level, message: &str);

    fn info(&self, message: &str) {
        self.notify(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.notify(Level::Warning, message);
    }

    fn error(&self, message: &str) {
        self.notify(Level::Error, message);
    }
}

/// Mirrors every notification to `tracing` and keeps it for a later flush.
#[derive(Debug, Default)]
pub struct OpsChannel {
    buffer: Mutex<Vec<Notification>>,
}

impl OpsChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything buffered so far.
    pub fn drain(&self) -> Vec<Notification> {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *buffer)
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<Notification> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Buffered messages at `level`.
    #[cfg(test)]
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|notification| notification.level == level)
            .map(|notification| notification.message)
            .collect()
    }
}

impl Notifier for OpsChannel {
    fn notify(&self, level: Level, message: &str) {
        match level {
            Level::Info => tracing::info!(target: "ops", "{message}"),
            Level::Warning => tracing::warn!(target: "ops", "{message}"),
            Level::Error => tracing::error!(target: "ops", "{message}"),
        }
        let notification = Notification {
            level,
            message: message.to_string(),
            raised_at: Local::now().naive_local(),
        };
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_by_level_and_drains() {
        let channel = OpsChannel::new();
        channel.info("Sent 3 emails");
        channel.warn("Missing setting Cohort Name");
        channel.error("Template has no subject");

        assert_eq!(channel.messages(Level::Warning), vec!["Missing setting Cohort Name"]);
        assert_eq!(channel.drain().len(), 3);
        assert!(channel.snapshot().is_empty());
    }

    #[test]
    fn level_names_round_trip() {
        for level in [Level::Info, Level::Warning, Level::Error] {
            assert_eq!(Level::parse(level.as_str()), Some(level));
        }
        assert_eq!(Level::parse("debug"), None);
    }
}

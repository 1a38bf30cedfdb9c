//! Structured logging sink consumed by caches, batches and references.
//!
//! The core never formats log lines itself; it reports a level, the component
//! (`source`), the operation (`feature`), a message and key/value data to a
//! [`Logger`]. [`TracingLogger`] forwards to `tracing`, [`MemoryLogger`] keeps
//! the calls for inspection.

use std::fmt;
use std::sync::Mutex;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Emergency,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Emergency => "emergency",
        };
        write!(f, "{label}")
    }
}

/// Key/value pairs attached to a log call.
pub type LogData<'a> = &'a [(&'a str, String)];

pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, source: &str, feature: &str, message: &str, data: LogData<'_>);
}

fn render_data(data: LogData<'_>) -> String {
    data.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Default sink: every call becomes a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, source: &str, feature: &str, message: &str, data: LogData<'_>) {
        let data = render_data(data);
        match level {
            LogLevel::Debug => {
                event!(Level::DEBUG, source = %source, feature = %feature, data = %data, "{}", message)
            }
            LogLevel::Info => {
                event!(Level::INFO, source = %source, feature = %feature, data = %data, "{}", message)
            }
            LogLevel::Warning => {
                event!(Level::WARN, source = %source, feature = %feature, data = %data, "{}", message)
            }
            LogLevel::Error => {
                event!(Level::ERROR, source = %source, feature = %feature, data = %data, "{}", message)
            }
            LogLevel::Emergency => event!(
                Level::ERROR,
                emergency = true,
                source = %source,
                feature = %feature,
                data = %data,
                "{}",
                message
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub source: String,
    pub feature: String,
    pub message: String,
    pub data: Vec<(String, String)>,
}

/// Sink that keeps every call in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Records at `level` or above.
    pub fn at_least(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.level >= level)
            .collect()
    }

    pub fn count(&self, level: LogLevel) -> usize {
        self.records()
            .iter()
            .filter(|record| record.level == level)
            .count()
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: LogLevel, source: &str, feature: &str, message: &str, data: LogData<'_>) {
        let record = LogRecord {
            level,
            source: source.to_string(),
            feature: feature.to_string(),
            message: message.to_string(),
            data: data
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        };
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_logger_filters_by_level() {
        let logger = MemoryLogger::new();
        logger.log(LogLevel::Debug, "Batch", "commit", "started", &[]);
        logger.log(
            LogLevel::Emergency,
            "EntityCache",
            "get",
            "corrupt record",
            &[("id", "abc".to_string())],
        );

        assert_eq!(logger.records().len(), 2);
        assert_eq!(logger.count(LogLevel::Emergency), 1);

        let severe = logger.at_least(LogLevel::Warning);
        assert_eq!(severe.len(), 1);
        assert_eq!(severe[0].source, "EntityCache");
        assert_eq!(severe[0].data, vec![("id".to_string(), "abc".to_string())]);

        logger.clear();
        assert!(logger.records().is_empty());
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Emergency > LogLevel::Error);
        assert!(LogLevel::Warning > LogLevel::Info);
        assert_eq!(LogLevel::Warning.to_string(), "warning");
    }
}

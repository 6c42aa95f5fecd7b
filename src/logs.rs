// src/logs.rs
//
// =============================================================================
// RUNSCRIBE: LOGGER
// =============================================================================
//
// Wires the `log` facade to env_logger, with two twists:
// 1. env_logger writes through the capture router's stderr tee, so log lines
//    emitted while a run is active end up in that run's log file.
// 2. Every Warn/Error record is also kept in a bounded in-memory buffer
//    (`LogBuffer`) so callers can inspect what the crate complained about.

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::capture::{OutputRouter, Stream};

// ============================================================================
// 1. THE BUFFER (State)
// ============================================================================

#[derive(Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Adds a line to the buffer, dropping the oldest if full.
    pub fn push(&self, msg: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(msg);
    }

    /// Returns a snapshot of the buffered lines, oldest first.
    pub fn get_lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Warn/Error records seen by the installed logger.
pub fn warnings() -> &'static LogBuffer {
    static WARNINGS: OnceLock<LogBuffer> = OnceLock::new();
    WARNINGS.get_or_init(|| LogBuffer::new(512))
}

// ============================================================================
// 2. THE LOGGER (Integration)
// ============================================================================

pub struct ScribeLogger {
    inner: env_logger::Logger,
    buffer: LogBuffer,
}

impl ScribeLogger {
    /// Installs the global logger (`RUST_LOG`, default `info`).
    ///
    /// Fails if another logger was installed first.
    pub fn init() -> Result<(), SetLoggerError> {
        let inner = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .target(env_logger::Target::Pipe(Box::new(
            OutputRouter::global().writer(Stream::Stderr),
        )))
        .build();

        let max = inner.filter().max(LevelFilter::Warn);
        let logger = Box::new(ScribeLogger {
            inner,
            buffer: warnings().clone(),
        });
        // Leak the box to create a static reference required by the 'log' crate singleton
        log::set_logger(Box::leak(logger)).map(|()| log::set_max_level(max))
    }
}

impl Log for ScribeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn || self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if record.level() <= Level::Warn {
            let timestamp = Local::now().format("%H:%M:%S");
            let target_full = record.target();
            let target = target_full.split("::").last().unwrap_or(target_full);
            self.buffer.push(format!(
                "[{} {} {}] {}",
                timestamp,
                record.level(),
                target,
                record.args()
            ));
        }
        if self.inner.matches(record) {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Convenience for binaries: install the logger, ignoring a prior install.
pub fn init_logging() {
    if ScribeLogger::init().is_err() {
        log::debug!("Logger already installed; keeping the existing one");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_drops_oldest_when_full() {
        let buf = LogBuffer::new(2);
        buf.push("a".into());
        buf.push("b".into());
        buf.push("c".into());
        assert_eq!(buf.get_lines(), vec!["b".to_string(), "c".to_string()]);
    }
}

//! Queue-backed `log` backend.
//!
//! Call sites on the engine task only format the message and `try_send` it;
//! a dedicated thread does the terminal I/O. When the queue is full the
//! record is dropped instead of stalling the caller.

use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::{Mutex, RwLock};

use crate::errors::LogError;

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Trace => "\x1b[90m",
        Level::Debug => "\x1b[36m",
        Level::Info => "\x1b[32m",
        Level::Warn => "\x1b[33m",
        Level::Error => "\x1b[31m",
    }
}

/// Parse a level name, falling back to `Info` on anything unknown.
/// Accepts the `log` spellings plus `warning` and `none`.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.trim().to_ascii_lowercase().as_str() {
        "warning" => LevelFilter::Warn,
        "none" | "disabled" => LevelFilter::Off,
        other => LevelFilter::from_str(other).unwrap_or(LevelFilter::Info),
    }
}

/// One formatted log line waiting for the writer thread.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub level: Level,
    pub target: String,
    pub message: String,
}

impl LogLine {
    pub fn new(level: Level, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            target: target.into(),
            message: message.into(),
        }
    }

    fn render(&self, color: bool) -> String {
        let ts = self.at.format("%Y-%m-%dT%H:%M:%S%.6fZ");
        if color {
            format!(
                "{DIM}{ts}{RESET} {}{:<5}{RESET} {DIM}{}{RESET} {}",
                level_color(self.level),
                self.level,
                self.target,
                self.message
            )
        } else {
            format!("{ts} {:<5} {} {}", self.level, self.target, self.message)
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub max_level: LevelFilter,
    /// Lines buffered for the writer thread before new ones are dropped.
    pub capacity: usize,
    /// ANSI colors on stderr.
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_level: LevelFilter::Info,
            capacity: 10_000,
            color: true,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: &str) -> Self {
        self.max_level = parse_level(level);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }
}

struct Active {
    lines: Sender<LogLine>,
    config: LogConfig,
}

static ACTIVE: RwLock<Option<Active>> = RwLock::new(None);
static WRITER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
static LOGGER: QueueLogger = QueueLogger;
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the queue logger as the process-wide `log` backend.
///
/// Calling it again replaces the queue and its configuration; the previous
/// writer thread is flushed and joined first.
pub fn init(config: LogConfig) -> Result<(), LogError> {
    shutdown();

    let (lines, queue) = bounded(config.capacity.max(1));
    let color = config.color;
    let writer = std::thread::Builder::new()
        .name("fastnet-log".into())
        .spawn(move || write_lines(queue, color))?;

    let max_level = config.max_level;
    *ACTIVE.write() = Some(Active { lines, config });
    *WRITER.lock() = Some(writer);

    if !INSTALLED.swap(true, Ordering::AcqRel) {
        if let Err(err) = log::set_logger(&LOGGER) {
            INSTALLED.store(false, Ordering::Release);
            shutdown();
            return Err(err.into());
        }
    }
    log::set_max_level(max_level);
    Ok(())
}

/// Change the level filter without restarting the writer.
pub fn set_level(level: LevelFilter) {
    if let Some(active) = ACTIVE.write().as_mut() {
        active.config.max_level = level;
        log::set_max_level(level);
    }
}

/// Current configuration, if the logger is running.
pub fn config() -> Option<LogConfig> {
    ACTIVE.read().as_ref().map(|active| active.config.clone())
}

/// Stop accepting lines, then wait for the writer to flush what is queued.
pub fn shutdown() {
    // Dropping the sender ends the writer loop once the queue is empty.
    ACTIVE.write().take();
    if let Some(writer) = WRITER.lock().take() {
        let _ = writer.join();
    }
}

/// Queue a line. Returns false when it was filtered out or dropped.
pub fn submit(line: LogLine) -> bool {
    let guard = ACTIVE.read();
    let Some(active) = guard.as_ref() else {
        return false;
    };
    if line.level > active.config.max_level {
        return false;
    }
    match active.lines.try_send(line) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
    }
}

struct QueueLogger;

impl Log for QueueLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        ACTIVE
            .read()
            .as_ref()
            .is_some_and(|active| metadata.level() <= active.config.max_level)
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            submit(LogLine::new(
                record.level(),
                record.target(),
                record.args().to_string(),
            ));
        }
    }

    fn flush(&self) {}
}

fn write_lines(queue: Receiver<LogLine>, color: bool) {
    let stderr = io::stderr();
    for line in queue.iter() {
        let mut out = stderr.lock();
        let _ = writeln!(out, "{}", line.render(color));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn level_names_parse_loosely() {
        assert_eq!(parse_level("WARNING"), LevelFilter::Warn);
        assert_eq!(parse_level(" debug "), LevelFilter::Debug);
        assert_eq!(parse_level("none"), LevelFilter::Off);
        assert_eq!(parse_level("bogus"), LevelFilter::Info);
    }

    #[test]
    fn plain_render_has_timestamp_level_target_message() {
        let mut line = LogLine::new(Level::Warn, "fastnet::core::engine", "client 3 write failed");
        line.at = Utc.timestamp_opt(0, 500_000_000).unwrap();
        assert_eq!(
            line.render(false),
            "1970-01-01T00:00:00.500000Z WARN  fastnet::core::engine client 3 write failed"
        );
        assert!(line.render(true).ends_with("client 3 write failed"));
    }

    #[test]
    fn reinit_replaces_configuration() {
        init(LogConfig::default().with_level("error").with_color(false)).unwrap();
        assert_eq!(config().map(|c| c.max_level), Some(LevelFilter::Error));
        assert!(!submit(LogLine::new(Level::Info, "test", "filtered")));
        assert!(submit(LogLine::new(Level::Error, "test", "kept")));

        init(LogConfig::default().with_capacity(4)).unwrap();
        set_level(LevelFilter::Debug);
        assert_eq!(config().map(|c| (c.max_level, c.capacity)), Some((LevelFilter::Debug, 4)));
        log::debug!("reaches the queue");

        // A second backend cannot be installed; the failure is a std error.
        let err = LogError::from(log::set_logger(&LOGGER).unwrap_err());
        let err: &dyn std::error::Error = &err;
        assert!(err.to_string().contains("already initialized"));

        shutdown();
        assert!(config().is_none());
        assert!(!submit(LogLine::new(Level::Error, "test", "after shutdown")));
    }
}

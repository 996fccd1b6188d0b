//! Log aggregation for supervised children.
//!
//! Every child writes one JSON object per line to stdout (the JSON layer of
//! `tracing-subscriber`). A forwarding task per child stream turns lines into
//! [`LogRecord`]s and pushes them into one bounded channel; a single consumer
//! task drains the channel into the configured [`LogSink`]s. Records of one
//! stream keep their order, records of different children interleave freely.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use taskroot_core::logging::{RECORD_FIELDS, RECORD_LEVEL, RECORD_MESSAGE, RECORD_TARGET};
use taskroot_core::{Error, Result};

static UNSAFE_COMPONENT_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^A-Za-z0-9._-]+").expect("component pattern is valid")
});

/// Make a component name safe for log targets and file names.
///
/// Runs of other characters become `_`, leading and trailing `.`, `_` and
/// `-` are trimmed, and an empty result becomes `"app"`.
pub fn sanitize_component(name: &str) -> String {
    let replaced = UNSAFE_COMPONENT_CHARS.replace_all(name, "_");
    let trimmed = replaced.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    if trimmed.is_empty() {
        "app".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" | "critical" | "fatal" => Ok(Self::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.pad(s)
    }
}

/// Which child pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    /// Level given to lines that are not structured records.
    fn raw_level(self) -> LogLevel {
        match self {
            Self::Stdout => LogLevel::Info,
            Self::Stderr => LogLevel::Warn,
        }
    }
}

/// One log record forwarded from a child process.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub component: String,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    pub fields: Map<String, JsonValue>,
}

impl LogRecord {
    /// Parse one output line of `component`.
    ///
    /// JSON objects carrying a `level` are read as structured records, every
    /// other line becomes a raw record with the whole line as message.
    pub fn parse_line(component: &str, stream: LogStream, line: &str) -> Self {
        let component = sanitize_component(component);
        if let Ok(JsonValue::Object(mut object)) = serde_json::from_str::<JsonValue>(line) {
            if let Some(level) = object
                .get(RECORD_LEVEL)
                .and_then(JsonValue::as_str)
                .and_then(|l| l.parse::<LogLevel>().ok())
            {
                let target = object
                    .get(RECORD_TARGET)
                    .and_then(JsonValue::as_str)
                    .unwrap_or(&component)
                    .to_string();
                let mut fields = match object.remove(RECORD_FIELDS) {
                    Some(JsonValue::Object(fields)) => fields,
                    _ => Map::new(),
                };
                let message = match fields
                    .remove(RECORD_MESSAGE)
                    .or_else(|| object.remove(RECORD_MESSAGE))
                {
                    Some(JsonValue::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                return Self {
                    component,
                    level,
                    target,
                    message,
                    fields,
                };
            }
        }

        Self {
            target: component.clone(),
            component,
            level: stream.raw_level(),
            message: line.to_string(),
            fields: Map::new(),
        }
    }
}

/// Destination of aggregated records.
pub trait LogSink: Send + Sync {
    fn write(&self, record: &LogRecord);
}

/// Re-emits forwarded records through this process's `tracing` subscriber.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, record: &LogRecord) {
        let fields = JsonValue::Object(record.fields.clone());
        let component = record.component.as_str();
        let source = record.target.as_str();
        let message = record.message.as_str();
        match record.level {
            LogLevel::Trace => trace!(component, source, fields = %fields, "{}", message),
            LogLevel::Debug => debug!(component, source, fields = %fields, "{}", message),
            LogLevel::Info => info!(component, source, fields = %fields, "{}", message),
            LogLevel::Warn => warn!(component, source, fields = %fields, "{}", message),
            LogLevel::Error => error!(component, source, fields = %fields, "{}", message),
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn for_component(&self, component: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.component == component)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn write(&self, record: &LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
    }
}

/// Writes each component's records to its own daily-rotated file,
/// `<dir>/<component>.<date>.log`.
pub struct FileSink {
    dir: PathBuf,
    files: Mutex<HashMap<String, RollingFileAppender>>,
}

impl FileSink {
    /// Create `dir` if needed. Files are opened on a component's first record.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn open(&self, component: &str) -> Result<RollingFileAppender> {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(component)
            .filename_suffix("log")
            .build(&self.dir)
            .map_err(|e| Error::Internal(format!("Failed to open log file for {}: {}", component, e)))
    }

    fn format(record: &LogRecord) -> String {
        let mut line = format!(
            "{} {:>5} {}: {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            record.level,
            record.target,
            record.message
        );
        if !record.fields.is_empty() {
            line.push(' ');
            line.push_str(&JsonValue::Object(record.fields.clone()).to_string());
        }
        line.push('\n');
        line
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink").field("dir", &self.dir).finish()
    }
}

impl LogSink for FileSink {
    fn write(&self, record: &LogRecord) {
        // sinks may be fed records that bypassed parse_line
        let component = sanitize_component(&record.component);
        let mut files = self
            .files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !files.contains_key(&component) {
            match self.open(&component) {
                Ok(appender) => {
                    files.insert(component.clone(), appender);
                }
                Err(e) => {
                    warn!(subsystem = "supervisor", component = %component, error = %e, "Log file unavailable");
                    return;
                }
            }
        }
        let Some(file) = files.get_mut(&component) else {
            return;
        };
        let line = Self::format(record);
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            warn!(subsystem = "supervisor", component = %component, error = %e, "Log file write failed");
        }
    }
}

/// Producer side of the aggregated log channel.
#[derive(Debug, Clone)]
pub struct LogSender {
    tx: mpsc::Sender<LogRecord>,
}

impl LogSender {
    /// Queue a record, waiting while the channel is full. Returns `false`
    /// once the aggregator is gone.
    pub async fn send(&self, record: LogRecord) -> bool {
        self.tx.send(record).await.is_ok()
    }

    /// Spawn a task forwarding every line of `reader` until EOF.
    pub fn forward<R>(&self, component: &str, stream: LogStream, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sender = self.clone();
        let component = component.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\r', '\n']);
                        if line.trim().is_empty() {
                            continue;
                        }
                        let record = LogRecord::parse_line(&component, stream, line);
                        if !sender.send(record).await {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(
                            subsystem = "supervisor",
                            component = %component,
                            error = %e,
                            "Log stream read failed"
                        );
                        break;
                    }
                }
            }
        })
    }
}

/// Bounded channel plus the single consumer draining it into sinks.
pub struct LogAggregator {
    sender: LogSender,
    consumer: JoinHandle<u64>,
}

impl LogAggregator {
    /// Start the consumer task. A zero capacity is treated as one.
    pub fn start(capacity: usize, sinks: Vec<Arc<dyn LogSink>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<LogRecord>(capacity.max(1));
        let consumer = tokio::spawn(async move {
            let mut delivered = 0u64;
            while let Some(record) = rx.recv().await {
                for sink in &sinks {
                    sink.write(&record);
                }
                delivered += 1;
            }
            delivered
        });
        Self {
            sender: LogSender { tx },
            consumer,
        }
    }

    pub fn sender(&self) -> LogSender {
        self.sender.clone()
    }

    /// Wait until every [`LogSender`] is dropped and the queue is drained.
    /// Returns how many records were delivered.
    pub async fn shutdown(self) -> u64 {
        drop(self.sender);
        match self.consumer.await {
            Ok(delivered) => {
                debug!(
                    subsystem = "supervisor",
                    result_count = delivered,
                    "Log aggregator stopped"
                );
                delivered
            }
            Err(e) => {
                warn!(subsystem = "supervisor", error = %e, "Log consumer task failed");
                0
            }
        }
    }
}

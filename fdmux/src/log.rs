//! Logging Infrastructure
//!
//! Structured logging for the reactors. Entries carry a level, a target
//! (`fdmux::reactor`, `fdmux::sharded`, ...), the emitting thread's name and
//! key/value fields, and are written to stderr as plain text or JSON.
//!
//! The default level is `Warn`, so a quiet process pays one atomic load per
//! suppressed entry. `init_from_env` reads `FDMUX_LOG_LEVEL` and
//! `FDMUX_LOG_FORMAT`.
//!
//! # Example
//!
//! ```rust
//! use fdmux::log::{LogBuilder, LogLevel};
//!
//! LogBuilder::new(LogLevel::Debug)
//!     .target("app")
//!     .message("registered descriptor")
//!     .field_int("fd", 7)
//!     .field_str("interest", "READABLE")
//!     .emit();
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Environment variable holding the minimum level.
pub const LEVEL_ENV: &str = "FDMUX_LOG_LEVEL";
/// Environment variable holding the output format.
pub const FORMAT_ENV: &str = "FDMUX_LOG_FORMAT";

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    Info = 2,
    /// Warning level.
    #[default]
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Off,
        }
    }

    /// Parse a log level name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "OFF" | "NONE" => Some(LogLevel::Off),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain text format (human readable).
    #[default]
    Plain,
    /// JSON format (machine readable).
    Json,
}

impl LogFormat {
    /// Parse a format name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// A value in a structured log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    /// String value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::String(s) => f.write_str(s),
            LogValue::Int(i) => write!(f, "{}", i),
            LogValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl LogValue {
    fn to_json(&self) -> String {
        match self {
            LogValue::String(s) => format!("\"{}\"", escape_json(s)),
            LogValue::Int(i) => i.to_string(),
            LogValue::Bool(b) => b.to_string(),
        }
    }
}

/// A log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Structured fields, in insertion order.
    pub fields: Vec<(String, LogValue)>,
    /// Timestamp (Unix milliseconds).
    pub timestamp: u64,
    /// Thread name (if available).
    pub thread_name: Option<String>,
    /// Module/target name.
    pub target: Option<&'static str>,
}

impl LogEntry {
    /// Create a new log entry stamped with the current time and thread.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
            timestamp,
            thread_name: std::thread::current().name().map(str::to_string),
            target: None,
        }
    }

    /// Format as plain text.
    pub fn format_plain(&self) -> String {
        let mut output = format!(
            "[{}.{:03}] {:<5} ",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.level.as_str()
        );
        if let Some(target) = self.target {
            output.push_str(&format!("[{}] ", target));
        }
        if let Some(thread) = &self.thread_name {
            output.push_str(&format!("({}) ", thread));
        }
        output.push_str(&self.message);

        if !self.fields.is_empty() {
            let fields: Vec<String> = self.fields.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            output.push_str(&format!(" {{{}}}", fields.join(", ")));
        }
        output
    }

    /// Format as JSON.
    pub fn format_json(&self) -> String {
        let mut output = format!(
            "{{\"timestamp\":{},\"level\":\"{}\"",
            self.timestamp,
            self.level.as_str()
        );
        if let Some(target) = self.target {
            output.push_str(&format!(",\"target\":\"{}\"", escape_json(target)));
        }
        if let Some(thread) = &self.thread_name {
            output.push_str(&format!(",\"thread\":\"{}\"", escape_json(thread)));
        }
        output.push_str(&format!(",\"message\":\"{}\"", escape_json(&self.message)));

        if !self.fields.is_empty() {
            let fields: Vec<String> = self
                .fields
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json(k), v.to_json()))
                .collect();
            output.push_str(&format!(",\"fields\":{{{}}}", fields.join(",")));
        }
        output.push('}');
        output
    }

    /// Format according to the given format.
    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Plain => self.format_plain(),
            LogFormat::Json => self.format_json(),
        }
    }
}

fn escape_json(s: &str) -> String {
    let mut output = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if c.is_control() => output.push_str(&format!("\\u{:04x}", c as u32)),
            c => output.push(c),
        }
    }
    output
}

/// Minimum log level (atomic for fast checking).
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

static JSON_FORMAT: AtomicBool = AtomicBool::new(false);

/// Serializes writers so concurrent entries do not interleave.
static OUTPUT: OnceLock<Mutex<()>> = OnceLock::new();

/// Apply `FDMUX_LOG_LEVEL` and `FDMUX_LOG_FORMAT`; unparsable values are ignored.
pub fn init_from_env() {
    if let Some(level) = std::env::var(LEVEL_ENV).ok().as_deref().and_then(LogLevel::parse) {
        set_level(level);
    }
    if let Some(format) = std::env::var(FORMAT_ENV).ok().as_deref().and_then(LogFormat::parse) {
        set_format(format);
    }
}

/// Set the minimum log level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get the current minimum log level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
}

/// Set the output format.
pub fn set_format(format: LogFormat) {
    JSON_FORMAT.store(format == LogFormat::Json, Ordering::Relaxed);
}

/// Get the current output format.
pub fn format() -> LogFormat {
    if JSON_FORMAT.load(Ordering::Relaxed) {
        LogFormat::Json
    } else {
        LogFormat::Plain
    }
}

/// Check if a log level would be logged.
pub fn would_log(level: LogLevel) -> bool {
    level != LogLevel::Off && level >= self::level()
}

/// Emit a log entry.
pub fn emit(entry: &LogEntry) {
    if !would_log(entry.level) {
        return;
    }
    let line = entry.format(format());
    let _guard = OUTPUT.get_or_init(|| Mutex::new(())).lock();
    let _ = writeln!(std::io::stderr().lock(), "{}", line);
}

/// Builder for log entries.
#[derive(Debug)]
pub struct LogBuilder {
    entry: LogEntry,
}

impl LogBuilder {
    /// Create a new log builder.
    pub fn new(level: LogLevel) -> Self {
        Self {
            entry: LogEntry::new(level, ""),
        }
    }

    /// Set the message.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.entry.message = msg.into();
        self
    }

    /// Set the target.
    pub fn target(mut self, target: &'static str) -> Self {
        self.entry.target = Some(target);
        self
    }

    /// Add a string field.
    pub fn field_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entry.fields.push((key.into(), LogValue::String(value.into())));
        self
    }

    /// Add an integer field.
    pub fn field_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.entry.fields.push((key.into(), LogValue::Int(value)));
        self
    }

    /// Add a boolean field.
    pub fn field_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.entry.fields.push((key.into(), LogValue::Bool(value)));
        self
    }

    /// Emit the log entry.
    pub fn emit(self) {
        emit(&self.entry);
    }
}

/// Log a message at the given level.
pub fn log(level: LogLevel, message: impl Into<String>) {
    if would_log(level) {
        emit(&LogEntry::new(level, message));
    }
}

/// Log a trace message.
pub fn trace(message: impl Into<String>) {
    log(LogLevel::Trace, message);
}

/// Log a debug message.
pub fn debug(message: impl Into<String>) {
    log(LogLevel::Debug, message);
}

/// Log an info message.
pub fn info(message: impl Into<String>) {
    log(LogLevel::Info, message);
}

/// Log a warning message.
pub fn warn(message: impl Into<String>) {
    log(LogLevel::Warn, message);
}

/// Log an error message.
pub fn error(message: impl Into<String>) {
    log(LogLevel::Error, message);
}

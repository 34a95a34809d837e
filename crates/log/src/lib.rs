//! Leveled logging for the node: a stderr sink with text or JSON lines and
//! an optional bounded in-memory ring for introspection.
//!
//! The logger is process-wide and configured once at startup; only the
//! threshold can be adjusted afterwards.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    fn rank(self) -> u8 {
        match self {
            Level::Error => 0,
            Level::Warn => 1,
            Level::Info => 2,
            Level::Debug => 3,
            Level::Trace => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Level {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, ()> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Level::Error),
            "warn" | "warning" => Ok(Level::Warn),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            "trace" => Ok(Level::Trace),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text,
    Json,
}

impl FromStr for Format {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, ()> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
    /// Records retained for introspection; zero disables the ring.
    pub capture: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
            capture: 0,
        }
    }
}

/// One emitted log line.
#[derive(Clone, Debug)]
pub struct Record {
    pub unix_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub message: String,
}

struct CaptureRing {
    entries: VecDeque<Record>,
    capacity: usize,
}

impl CaptureRing {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(&mut self, record: Record) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    fn tail(&self, limit: usize) -> Vec<Record> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

struct Logger {
    threshold: AtomicU8,
    format: Format,
    timestamps: bool,
    capture: Option<Mutex<CaptureRing>>,
}

impl Logger {
    fn from_config(config: LogConfig) -> Self {
        Self {
            threshold: AtomicU8::new(config.level.rank()),
            format: config.format,
            timestamps: config.timestamps,
            capture: if config.capture > 0 {
                Some(Mutex::new(CaptureRing::new(config.capture)))
            } else {
                None
            },
        }
    }

    fn emit(&self, record: Record) {
        let mut sink = io::stderr().lock();
        match self.format {
            Format::Text => {
                if self.timestamps {
                    let _ = write!(sink, "{} ", format_utc(record.unix_ms));
                }
                let _ = writeln!(
                    sink,
                    "[{}] {} {}",
                    record.level, record.target, record.message
                );
            }
            Format::Json => {
                let line = json!({
                    "time_ms": record.unix_ms,
                    "level": record.level.label(),
                    "target": record.target,
                    "message": record.message,
                });
                let _ = writeln!(sink, "{line}");
            }
        }
        drop(sink);

        if let Some(ring) = &self.capture {
            if let Ok(mut guard) = ring.lock() {
                guard.push(record);
            }
        }
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

fn logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::from_config(LogConfig::default()))
}

/// Installs the logger. A second call cannot change the sink or ring, but
/// still applies the requested threshold.
pub fn init(config: LogConfig) {
    let installed = LOGGER.set(Logger::from_config(config)).is_ok();
    if !installed {
        set_level(config.level);
    }
}

pub fn set_level(level: Level) {
    logger().threshold.store(level.rank(), Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level.rank() <= logger().threshold.load(Ordering::Relaxed)
}

pub fn emit(level: Level, target: &'static str, args: fmt::Arguments<'_>) {
    let logger = logger();
    if level.rank() > logger.threshold.load(Ordering::Relaxed) {
        return;
    }
    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    logger.emit(Record {
        unix_ms,
        level,
        target,
        message: args.to_string(),
    });
}

/// The most recent captured records, oldest first.
pub fn recent(limit: usize) -> Vec<Record> {
    match &logger().capture {
        Some(ring) => match ring.lock() {
            Ok(guard) => guard.tail(limit),
            Err(_) => Vec::new(),
        },
        None => Vec::new(),
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::emit($level, module_path!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log!($crate::Level::Error, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log!($crate::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log!($crate::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log!($crate::Level::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => { $crate::log!($crate::Level::Trace, $($arg)*) };
}

fn is_leap_year(year: u64) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// `YYYY-MM-DD HH:MM:SS.mmm` in UTC, by walking years then months from the
/// epoch. Log volume is low enough that the linear walk is irrelevant.
fn format_utc(unix_ms: u64) -> String {
    const MONTH_DAYS: [u64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

    let seconds = unix_ms / 1000;
    let mut days = seconds / 86_400;
    let time_of_day = seconds % 86_400;

    let mut year: u64 = 1970;
    loop {
        let year_days = if is_leap_year(year) { 366 } else { 365 };
        if days < year_days {
            break;
        }
        days -= year_days;
        year += 1;
    }

    let mut month = 0usize;
    loop {
        let mut month_days = MONTH_DAYS[month];
        if month == 1 && is_leap_year(year) {
            month_days += 1;
        }
        if days < month_days {
            break;
        }
        days -= month_days;
        month += 1;
    }

    format!(
        "{year:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
        month + 1,
        days + 1,
        time_of_day / 3_600,
        time_of_day % 3_600 / 60,
        time_of_day % 60,
        unix_ms % 1_000
    )
}

//! Process-wide logging for the node crates.
//!
//! Records go to stderr either as plain text or as one JSON object per line.
//! Besides the usual severity threshold, records can be tagged with a debug
//! [`Category`]; categorised records at debug level are only emitted when that
//! category was switched on (the `--debug <category>` option).

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Debug categories, one bit each.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Category {
    Mempool,
    MempoolRej,
    Net,
    Bench,
    Reindex,
    Validation,
    Prune,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Mempool,
        Category::MempoolRej,
        Category::Net,
        Category::Bench,
        Category::Reindex,
        Category::Validation,
        Category::Prune,
    ];

    pub fn bit(self) -> u32 {
        1u32 << (self as u32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Mempool => "mempool",
            Category::MempoolRej => "mempoolrej",
            Category::Net => "net",
            Category::Bench => "bench",
            Category::Reindex => "reindex",
            Category::Validation => "validation",
            Category::Prune => "prune",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|cat| cat.as_str() == raw)
    }
}

/// Parses a `--debug` value into a category mask. `1` and `all` enable every
/// category, `0` and `none` clear them.
pub fn parse_categories<'a, I>(values: I) -> Result<u32, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut mask = 0u32;
    for value in values {
        for part in value.split(',') {
            let part = part.trim();
            match part.to_ascii_lowercase().as_str() {
                "" => {}
                "1" | "all" => mask = u32::MAX,
                "0" | "none" => mask = 0,
                other => {
                    let cat = Category::parse(other)
                        .ok_or_else(|| format!("unknown debug category '{other}'"))?;
                    mask |= cat.bit();
                }
            }
        }
    }
    Ok(mask)
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
    pub categories: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
            categories: 0,
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static LOG_CATEGORIES: AtomicU32 = AtomicU32::new(0);
static LOG_STDERR_ENABLED: AtomicBool = AtomicBool::new(true);

#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub category: Option<Category>,
    pub target: &'static str,
    pub msg: String,
}

static CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);
static CAPTURE_CAPACITY: AtomicUsize = AtomicUsize::new(0);
static CAPTURE: OnceLock<Mutex<VecDeque<CapturedLog>>> = OnceLock::new();

pub fn init(config: LogConfig) {
    LOG_LEVEL.store(config.level as u8, Ordering::Relaxed);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
    LOG_CATEGORIES.store(config.categories, Ordering::Relaxed);
}

pub fn set_stderr_enabled(enabled: bool) {
    LOG_STDERR_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        CAPTURE_ENABLED.store(false, Ordering::Relaxed);
        return;
    }
    CAPTURE_CAPACITY.store(capacity, Ordering::Relaxed);
    CAPTURE.get_or_init(|| Mutex::new(VecDeque::with_capacity(capacity.min(4096))));
    CAPTURE_ENABLED.store(true, Ordering::Relaxed);
}

pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    let Some(buf) = CAPTURE.get() else {
        return Vec::new();
    };
    let Ok(guard) = buf.lock() else {
        return Vec::new();
    };
    let start = guard.len().saturating_sub(limit);
    guard.iter().skip(start).cloned().collect()
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn category_enabled(category: Category) -> bool {
    LOG_CATEGORIES.load(Ordering::Relaxed) & category.bit() != 0
}

/// Category records bypass the severity threshold once their category is on,
/// mirroring `-debug=<cat>` which is independent of the log level.
pub fn category_record_enabled(category: Category) -> bool {
    category_enabled(category) || enabled(Level::Trace)
}

pub fn log(level: Level, target: &'static str, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    emit(level, None, target, args);
}

pub fn log_category(category: Category, target: &'static str, args: fmt::Arguments<'_>) {
    if !category_record_enabled(category) {
        return;
    }
    emit(Level::Debug, Some(category), target, args);
}

fn emit(level: Level, category: Option<Category>, target: &'static str, args: fmt::Arguments<'_>) {
    let capture = CAPTURE_ENABLED.load(Ordering::Relaxed);
    let format = match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => Format::Json,
        _ => Format::Text,
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ts_ms: u64 = now.as_millis().try_into().unwrap_or(u64::MAX);
    let msg = if matches!(format, Format::Json) || capture {
        Some(args.to_string())
    } else {
        None
    };

    if LOG_STDERR_ENABLED.load(Ordering::Relaxed) {
        let mut out = io::stderr().lock();
        match format {
            Format::Text => {
                if LOG_TIMESTAMPS.load(Ordering::Relaxed) {
                    let ts = Timestamp {
                        unix_seconds: now.as_secs(),
                        millis: now.subsec_millis(),
                    };
                    let _ = write!(out, "{ts} ");
                }
                match category {
                    Some(cat) => {
                        let _ = write!(out, "{} [{}] {}: ", level.as_str(), cat.as_str(), target);
                    }
                    None => {
                        let _ = write!(out, "{} {}: ", level.as_str(), target);
                    }
                }
                let _ = writeln!(out, "{args}");
            }
            Format::Json => {
                let line = json!({
                    "ts_ms": ts_ms,
                    "level": level.as_str(),
                    "category": category.map(Category::as_str),
                    "target": target,
                    "msg": msg.as_deref().unwrap_or_default(),
                });
                let _ = writeln!(out, "{line}");
            }
        }
    }

    if capture {
        let Some(buf) = CAPTURE.get() else {
            return;
        };
        let Ok(mut guard) = buf.lock() else {
            return;
        };
        let cap = CAPTURE_CAPACITY.load(Ordering::Relaxed);
        guard.push_back(CapturedLog {
            ts_ms,
            level,
            category,
            target,
            msg: msg.unwrap_or_default(),
        });
        while guard.len() > cap {
            let _ = guard.pop_front();
        }
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

/// `log_cat!(Category::Mempool, "...")`
#[macro_export]
macro_rules! log_cat {
    ($cat:expr, $($arg:tt)*) => {{
        if $crate::category_record_enabled($cat) {
            $crate::log_category($cat, module_path!(), format_args!($($arg)*));
        }
    }};
}

struct Timestamp {
    unix_seconds: u64,
    millis: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = (self.unix_seconds / 86_400) as i64;
        let secs_of_day = self.unix_seconds % 86_400;
        let (year, month, day) = civil_from_days(days);
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            secs_of_day / 3600,
            (secs_of_day % 3600) / 60,
            secs_of_day % 60,
            self.millis
        )
    }
}

/// Formats a unix timestamp the way block times are shown in log lines.
pub fn format_unix_time(unix_seconds: i64) -> String {
    Timestamp {
        unix_seconds: unix_seconds.max(0) as u64,
        millis: 0,
    }
    .to_string()
}

// Howard Hinnant's days-to-civil conversion.
fn civil_from_days(days: i64) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe as i32) + (era as i32) * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (y + i32::from(m <= 2), m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("nope"), None);
    }

    #[test]
    fn parse_format() {
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("nope"), None);
    }

    #[test]
    fn debug_categories_accumulate() {
        let mask = parse_categories(["mempool,net", "bench"]).expect("categories");
        assert_ne!(mask & Category::Mempool.bit(), 0);
        assert_ne!(mask & Category::Net.bit(), 0);
        assert_ne!(mask & Category::Bench.bit(), 0);
        assert_eq!(mask & Category::Reindex.bit(), 0);
        assert_eq!(parse_categories(["all"]).expect("all"), u32::MAX);
        assert_eq!(parse_categories(["net", "0"]).expect("none"), 0);
        assert!(parse_categories(["bogus"]).is_err());
    }

    #[test]
    fn block_time_formatting() {
        assert_eq!(format_unix_time(1231006505), "2009-01-03T18:15:05.000Z");
    }
}

//! Kernel-style print macros for strand
//!
//! Thread-safe, leveled stderr logging in the spirit of printk. Every leveled
//! line carries the worker and task the calling thread is currently running:
//!
//! ```text
//! [DEBUG] [w2 t41] job j57 ACTIVE -> COMPLETING
//! [ERROR] [main] uncaught failure in t12: task failed: connection reset
//! ```
//!
//! # Environment Variables
//!
//! - `STRAND_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//! - `STRAND_FLUSH_EPRINT=1` - flush stderr after each line
//! - `STRAND_LOG_TIME=1` - prefix milliseconds since logger init
//!
//! # Usage
//!
//! ```ignore
//! use strand_core::{kinfo, kdebug, kerror};
//!
//! kinfo!("runtime started with {} workers", n);
//! kdebug!("job {} cancelled", id);
//! kerror!("uncaught failure: {}", err);
//! ```

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use crate::env::{env_get_bool, parse_bool};

/// Log levels (matches common conventions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; `None` for unknown spellings
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static START: OnceLock<Instant> = OnceLock::new();

const NO_ID: u64 = u64::MAX;

thread_local! {
    static WORKER_ID: Cell<u64> = const { Cell::new(NO_ID) };
    static TASK_ID: Cell<u64> = const { Cell::new(NO_ID) };
}

/// Initialize logging from environment variables
///
/// Called automatically on first log; explicit calls make initialization
/// deterministic.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    START.get_or_init(Instant::now);

    FLUSH_ENABLED.store(env_get_bool("STRAND_FLUSH_EPRINT", false), Ordering::Relaxed);
    TIME_ENABLED.store(env_get_bool("STRAND_LOG_TIME", false), Ordering::Relaxed);

    if let Ok(val) = std::env::var("STRAND_LOG_LEVEL") {
        // A bare boolean turns debug output on or off
        let level = LogLevel::parse(&val).or_else(|| {
            parse_bool(&val).map(|on| if on { LogLevel::Debug } else { LogLevel::Off })
        });
        if let Some(level) = level {
            LOG_LEVEL.store(level as u8, Ordering::Relaxed);
        }
    }
}

#[inline]
fn ensure_init() {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    ensure_init();
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    ensure_init();
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically (overrides the environment)
pub fn set_log_level(level: LogLevel) {
    ensure_init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    ensure_init();
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn set_time_enabled(enabled: bool) {
    ensure_init();
    TIME_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= log_level() as u8
}

// ============================================================================
// Per-thread context
// ============================================================================

/// Tag log lines from this thread with a worker index
pub fn set_worker_id(id: u32) {
    WORKER_ID.with(|c| c.set(id as u64));
}

pub fn clear_worker_id() {
    WORKER_ID.with(|c| c.set(NO_ID));
}

/// Tag log lines from this thread with the task being polled
pub fn set_task_id(id: u64) {
    TASK_ID.with(|c| c.set(id));
}

pub fn clear_task_id() {
    TASK_ID.with(|c| c.set(NO_ID));
}

/// Render the `[w2 t41]` context tag for the calling thread
pub fn context_tag() -> String {
    let worker = WORKER_ID.with(|c| c.get());
    let task = TASK_ID.with(|c| c.get());
    match (worker, task) {
        (NO_ID, NO_ID) => {
            let current = std::thread::current();
            format!("[{}]", current.name().unwrap_or("?"))
        }
        (NO_ID, t) => format!("[t{}]", t),
        (w, NO_ID) => format!("[w{}]", w),
        (w, t) => format!("[w{} t{}]", w, t),
    }
}

// ============================================================================
// Output
// ============================================================================

/// Internal: write and optionally flush
#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Internal: leveled line with context tag
#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    // Render before locking stderr so the lock covers only the write
    let tag = context_tag();
    let elapsed = if TIME_ENABLED.load(Ordering::Relaxed) {
        START.get().map(|s| s.elapsed().as_millis())
    } else {
        None
    };

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = match elapsed {
        Some(ms) => write!(handle, "{} {:>8}ms {} ", level.prefix(), ms, tag),
        None => write!(handle, "{} {} ", level.prefix(), tag),
    };
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr (no newline, no level)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!($($arg)*));
    }};
}

/// Print to stderr with newline (no level)
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprint_impl(format_args!("\n"));
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!("{}\n", format_args!($($arg)*)));
    }};
}

/// Error level log (shown unless logging is off)
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        if $crate::kprint::level_enabled($crate::kprint::LogLevel::Debug) {
            $crate::kprint::_klog_impl(
                $crate::kprint::LogLevel::Debug,
                format_args!($($arg)*)
            );
        }
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        if $crate::kprint::level_enabled($crate::kprint::LogLevel::Trace) {
            $crate::kprint::_klog_impl(
                $crate::kprint::LogLevel::Trace,
                format_args!($($arg)*)
            );
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels_ordered() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("2"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_context_tag() {
        set_worker_id(3);
        set_task_id(41);
        assert_eq!(context_tag(), "[w3 t41]");
        clear_task_id();
        assert_eq!(context_tag(), "[w3]");
        clear_worker_id();
        set_task_id(7);
        assert_eq!(context_tag(), "[t7]");
        clear_task_id();
        assert!(context_tag().starts_with('['));
    }

    #[test]
    fn test_macros_compile() {
        // Output is checked by hand; this only exercises the expansion
        set_log_level(LogLevel::Off);
        kprint!("x");
        kprintln!("x {}", 1);
        kerror!("e {}", "msg");
        kwarn!("w");
        kinfo!("i");
        kdebug!("d");
        ktrace!("t");
        assert!(!level_enabled(LogLevel::Error));
    }
}

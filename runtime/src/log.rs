//! Logging: tick-stamped, ring-buffer-backed records (§4.14).
//!
//! `log()` is the `log(fmt, ...)` entry from §6, resolving to an entry in a
//! fixed-capacity ring buffer rather than anything that allocates on the hot
//! path — the same contract the teacher's `ringbuf` crate gives individual
//! drivers, generalized here to one shared runtime-wide buffer. A module
//! that wants its own independent, inspectable history (matching the
//! teacher's one-ringbuf-per-driver convention) can declare one directly
//! with [`prs_ringbuf::ringbuf!`] using [`LogRecord`] as the payload type.

use std::fmt::{Arguments, Write as _};

use abi::LogLevel;
use ringbuf::ringbuf;

/// Longest message `log()` records verbatim; longer messages are truncated,
/// not rejected, since the ring buffer's payload must be `Copy` and fixed
/// size — there is no heap-backed fallback on the always-on path.
pub const MESSAGE_CAPACITY: usize = 96;

/// One log record: when it happened, how severe it was, which module wrote
/// it, and an inline, truncated copy of the formatted message.
#[derive(Copy, Clone, PartialEq)]
pub struct LogRecord {
    pub tick: u64,
    pub level: LogLevel,
    pub module: &'static str,
    len: u8,
    bytes: [u8; MESSAGE_CAPACITY],
}

const EMPTY_RECORD: LogRecord =
    LogRecord { tick: 0, level: LogLevel::Info, module: "", len: 0, bytes: [0; MESSAGE_CAPACITY] };

impl Default for LogRecord {
    fn default() -> Self {
        EMPTY_RECORD
    }
}

impl LogRecord {
    fn new(tick: u64, level: LogLevel, module: &'static str, args: Arguments<'_>) -> Self {
        let mut writer = ArrayWriter { bytes: [0; MESSAGE_CAPACITY], len: 0 };
        // `ArrayWriter::write_str` never fails; a message that doesn't fit
        // is silently truncated rather than losing the whole record.
        let _ = write!(writer, "{args}");
        Self { tick, level, module, len: writer.len as u8, bytes: writer.bytes }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("<invalid utf8>")
    }
}

struct ArrayWriter {
    bytes: [u8; MESSAGE_CAPACITY],
    len: usize,
}

impl std::fmt::Write for ArrayWriter {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        let remaining = MESSAGE_CAPACITY - self.len;
        let take = remaining.min(s.len());
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

ringbuf!(RUNTIME_LOG, LogRecord, 256, EMPTY_RECORD);

/// Records a log entry, timestamped with `tick` (§6 `log(fmt, ...)`).
/// `module` is expected to be the call site's `module_path!()`; see
/// [`prs_log!`](crate::prs_log) for a macro that supplies both that and the
/// `format_args!` plumbing.
pub fn log(tick: u64, level: LogLevel, module: &'static str, args: Arguments<'_>) {
    RUNTIME_LOG.record(LogRecord::new(tick, level, module, args));
}

/// Copies out every live record in the shared runtime log, oldest first.
/// For tests and diagnostic dumps; not the hot path.
#[must_use]
pub fn snapshot() -> Vec<LogRecord> {
    RUNTIME_LOG.snapshot().into_iter().map(|e| e.payload).collect()
}

/// A host-supplied additional drain for log records (stderr, the standard
/// `log` facade, a remote collector). The ring buffer above remains the
/// always-on, allocation-free path; a sink is purely additive.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &LogRecord);
}

/// Bridges into the `log` crate's facade so ordinary Rust logging consumers
/// (`env_logger`, `fern`, …) can observe runtime records too.
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn emit(&self, record: &LogRecord) {
        let level = match record.level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        };
        log::log!(target: record.module, level, "[tick {}] {}", record.tick, record.message());
    }
}

/// Calls `log()` with the call site's own `module_path!()` and a
/// `format_args!`-style message, so callers don't have to spell either out.
#[macro_export]
macro_rules! prs_log {
    ($tick:expr, $level:expr, $($arg:tt)+) => {
        $crate::log::log($tick, $level, module_path!(), format_args!($($arg)+))
    };
}

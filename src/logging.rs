//! Log sinks.
//!
//! Components never log through a process-wide callback. Each one receives
//! an [`Arc<dyn LogSink>`] and reports at one of four normalized severities.
//! [`LogBridge`] forwards into the `log` facade; [`init`] installs the
//! env_logger backend used by the binary.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "LUKS2_LOG_FORMAT";
const LEVEL_ENV: &str = "LUKS2_LOG_LEVEL";

/// Raw level: normal message.
pub const RAW_LEVEL_NORMAL: i32 = 0;
/// Raw level: error.
pub const RAW_LEVEL_ERROR: i32 = 1;
/// Raw level: verbose.
pub const RAW_LEVEL_VERBOSE: i32 = 2;
/// Raw level: debug.
pub const RAW_LEVEL_DEBUG: i32 = -1;

/// Normalized message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Error,
}

impl Severity {
    /// Map a raw library level. Unknown levels come back as `Err` so the
    /// caller can report them before treating the message as an error.
    pub fn from_raw(level: i32) -> std::result::Result<Self, i32> {
        match level {
            RAW_LEVEL_NORMAL => Ok(Severity::Notice),
            RAW_LEVEL_ERROR => Ok(Severity::Error),
            RAW_LEVEL_VERBOSE => Ok(Severity::Info),
            RAW_LEVEL_DEBUG => Ok(Severity::Debug),
            other => Err(other),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Notice => "notice",
            Severity::Error => "error",
        }
    }
}

/// Destination for diagnostic messages.
pub trait LogSink: Send + Sync {
    /// Deliver one message.
    fn log(&self, severity: Severity, message: &str);

    /// Whether debug messages are wanted at all.
    fn debug_enabled(&self) -> bool {
        true
    }

    /// Deliver a message tagged with a raw library level.
    fn log_raw(&self, level: i32, message: &str) {
        match Severity::from_raw(level) {
            Ok(severity) => self.log(severity, message),
            Err(unknown) => {
                self.log(Severity::Error, &format!("Unknown log level: {}", unknown));
                self.log(Severity::Error, message);
            }
        }
    }

    fn debug(&self, message: &str) {
        if self.debug_enabled() {
            self.log(Severity::Debug, message);
        }
    }

    fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    fn notice(&self, message: &str) {
        self.log(Severity::Notice, message);
    }

    fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }
}

/// Forwards messages to the `log` facade under a fixed target.
#[derive(Debug, Clone)]
pub struct LogBridge {
    target: &'static str,
}

impl LogBridge {
    /// Bridge tagging records with `target`.
    pub fn new(target: &'static str) -> Self {
        Self { target }
    }

    /// A bridge wrapped for injection.
    pub fn shared() -> Arc<dyn LogSink> {
        Arc::new(Self::default())
    }
}

impl Default for LogBridge {
    fn default() -> Self {
        Self::new("luks2")
    }
}

impl LogSink for LogBridge {
    fn log(&self, severity: Severity, message: &str) {
        // `log` has no notice level; info is the nearest without raising alarms.
        let level = match severity {
            Severity::Debug => log::Level::Debug,
            Severity::Info | Severity::Notice => log::Level::Info,
            Severity::Error => log::Level::Error,
        };
        log::log!(target: self.target, level, "{}", message);
    }

    fn debug_enabled(&self) -> bool {
        log::log_enabled!(target: self.target, log::Level::Debug)
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _severity: Severity, _message: &str) {}

    fn debug_enabled(&self) -> bool {
        false
    }
}

/// Collects messages in memory, for callers that surface them later.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(Severity, String)>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    pub fn records(&self) -> Vec<(Severity, String)> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Whether any message at `severity` contains `needle`.
    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|(s, m)| *s == severity && m.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, severity: Severity, message: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.push((severity, message.to_string()));
        }
    }
}

/// Initialize the global logger for the binary.
///
/// The first caller wins; subsequent calls are no-ops. If `RUST_LOG` is
/// unset, `default_level` is used, overridable via `LUKS2_LOG_LEVEL`.
/// `LUKS2_LOG_FORMAT=json` switches to one JSON object per line.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let default_level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let env = Env::default().default_filter_or(default_level);

    let format = env::var(FORMAT_ENV)
        .unwrap_or_else(|_| String::from("plain"))
        .to_lowercase();

    let mut builder = env_logger::Builder::from_env(env);
    if format == "json" {
        builder.format(|buf, record| {
            let ts = buf.timestamp().to_string();
            let payload = json!({
                "timestamp": ts,
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", payload)
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {} - {}",
                record.level().to_string().to_lowercase(),
                record.target(),
                record.args()
            )
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
/// Log severities, ordered from chattiest to most severe.
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

const THRESHOLD_UNSET: u8 = u8::MAX;

/// Verbosity floor installed by `connect()` from `logging.debug`.
static THRESHOLD: AtomicU8 = AtomicU8::new(THRESHOLD_UNSET);
static ENV_DEBUG: OnceLock<bool> = OnceLock::new();

/// `JML_DEBUG` forces debug output on regardless of configuration, for
/// troubleshooting a deployment without touching its config.
fn env_debug() -> bool {
    *ENV_DEBUG.get_or_init(|| {
        std::env::var("JML_DEBUG")
            .ok()
            .map(|v| {
                let normalized = v.trim().to_ascii_lowercase();
                normalized == "1" || normalized == "true" || normalized == "yes"
            })
            .unwrap_or(false)
    })
}

/// Installs the configured verbosity: debug on, or the default info floor.
pub fn set_debug(enabled: bool) {
    let level = if enabled { Level::Debug } else { Level::Info };
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

fn effective_threshold(configured: u8, env_debug: bool) -> u8 {
    if env_debug {
        configured.min(Level::Debug as u8)
    } else {
        configured
    }
}

/// Whether a line at `level` would be written.
pub fn enabled(level: Level) -> bool {
    let configured = match THRESHOLD.load(Ordering::Relaxed) {
        THRESHOLD_UNSET => Level::Info as u8,
        value => value,
    };
    level as u8 >= effective_threshold(configured, env_debug())
}

fn ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn log(level: Level, message: impl AsRef<str>) {
    if !enabled(level) {
        return;
    }
    eprintln!("[{}][{}] {}", ts(), level.as_str(), message.as_ref());
}

pub fn debug(message: impl AsRef<str>) {
    log(Level::Debug, message);
}

pub fn info(message: impl AsRef<str>) {
    log(Level::Info, message);
}

pub fn warn(message: impl AsRef<str>) {
    log(Level::Warn, message);
}

pub fn error(message: impl AsRef<str>) {
    log(Level::Error, message);
}

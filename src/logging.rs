//! Process logger behind the `log` facade.
//!
//! Lines carry a millisecond timestamp and the thread name, which is the
//! worker name for staff, drone and snapshot threads.

use std::io::Write;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};

const LEVEL_ENV: &str = "SUSHI_LOG";

struct DevLogger;

static LOGGER: DevLogger = DevLogger;

impl Log for DevLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let current = thread::current();
        let thread_name = current.name().unwrap_or("unnamed");
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{ts}ms][{thread_name}] {:<5} {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    }
}

fn parse_level(raw: &str) -> Option<LevelFilter> {
    raw.trim().parse::<LevelFilter>().ok()
}

/// Install the logger. Safe to call more than once.
pub fn init() {
    let level = std::env::var(LEVEL_ENV)
        .ok()
        .and_then(|raw| parse_level(&raw))
        .unwrap_or_else(default_level);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

//! `log` facade backend.
//!
//! Boot-critical bring-up lines go through `println!`/`serial_println!`
//! directly (they need to work before this is installed); everything after
//! `init()` runs should prefer `log::info!`/`log::warn!`/etc. so verbosity
//! can be filtered without touching call sites.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::serial_println!(
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the global logger. Idempotent: a second call is a no-op error
/// that `init` swallows, since test binaries may share a boot path.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

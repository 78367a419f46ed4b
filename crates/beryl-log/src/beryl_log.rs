use std::io::Write;

use chrono::Local;
use log::{Level, Log, Metadata, Record, SetLoggerError};

pub static BERYL_LOGGER: BerylLogger = BerylLogger;

pub struct BerylLogger;

impl BerylLogger {
    /// Installs the logger as the global `log` backend.
    pub fn init(level: Level) -> Result<(), SetLoggerError> {
        log::set_logger(&BERYL_LOGGER)?;
        log::set_max_level(level.to_level_filter());
        Ok(())
    }
}

impl Log for BerylLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = Local::now();
            println!(
                "{} {} {}",
                now.format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

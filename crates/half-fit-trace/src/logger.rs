//! Console backend for the `log` facade.

use std::{fmt, sync::OnceLock, time::Instant};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::color::Color;

static LOGGER: ConsoleLogger = ConsoleLogger;
static START: OnceLock<Instant> = OnceLock::new();

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = START.get_or_init(Instant::now).elapsed();
        eprintln!(
            "{:>10.6} {} {} {}",
            elapsed.as_secs_f64(),
            LevelFormat(record.level()),
            Color::DarkGray.paint(record.target()),
            record.args()
        );
    }

    fn flush(&self) {}
}

struct LevelFormat(Level);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            Level::Trace => Color::Magenta,
            Level::Debug => Color::Blue,
            Level::Info => Color::Green,
            Level::Warn => Color::Yellow,
            Level::Error => Color::Red,
        };
        let msg = match self.0 {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        };
        write!(f, "{}", color.paint(msg))
    }
}

/// Installs the console logger, printing records up to `level` to stderr.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    START.get_or_init(Instant::now);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

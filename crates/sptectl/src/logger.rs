//! Stderr logger for the command-line tool.

use std::io::Write;

use log::LevelFilter;
use spin::Once;

pub struct StderrLogger {
    detailed: bool,
}

static DEFAULT: Once<StderrLogger> = Once::new();

impl StderrLogger {
    /// Installs the logger. Each level of `verbosity` above zero enables the next log
    /// level, starting from warnings; at debug and above records carry their source
    /// location.
    pub fn init(verbosity: u8) -> Result<&'static Self, log::SetLoggerError> {
        let level = match verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let logger = DEFAULT.call_once(|| StderrLogger {
            detailed: level >= LevelFilter::Debug,
        });
        log::set_logger(logger)?;
        log::set_max_level(level);
        Ok(logger)
    }
}

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut stderr = std::io::stderr().lock();
        // Nowhere left to report a failed write to stderr.
        let _ = write_log_entry_to(&mut stderr, record, self.detailed);
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn write_log_entry_to(
    writer: &mut impl Write,
    record: &log::Record,
    detailed: bool,
) -> std::io::Result<()> {
    if detailed {
        writeln!(
            writer,
            "[{} {}:{} {}] {}",
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.target(),
            record.args()
        )
    } else {
        writeln!(writer, "[{:5}] {}", record.level(), record.args())
    }
}

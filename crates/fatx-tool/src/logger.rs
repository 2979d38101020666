use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct TerminalLogger;

static LOGGER: TerminalLogger = TerminalLogger;

impl Log for TerminalLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = record.level();
        let tag = format!("{level:5}");
        let tag = match level {
            Level::Error => tag.bright_red(),
            Level::Warn => tag.bright_yellow(),
            Level::Info => tag.bright_blue(),
            Level::Debug => tag.bright_cyan(),
            Level::Trace => tag.bright_magenta(),
        };
        eprintln!("{tag} {}", record.args());
    }

    fn flush(&self) {}
}

/// Installs the terminal logger. Warnings and errors are always shown,
/// `verbose` adds the driver's info and debug messages.
pub fn init(verbose: bool) -> Result<(), log::SetLoggerError> {
    log::set_max_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });
    log::set_logger(&LOGGER)
}

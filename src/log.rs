//! Logging.
//!
//! All diagnostic output in this crate goes through the `log` crate's
//! macros. This module provides the one logger that is ever installed,
//! picking its backend and verbosity from whichever binary's
//! configuration calls [`Logger::switch`].

use std::{fs, io, process};
use std::io::Write;
use std::ops::DerefMut;
use std::path::PathBuf;
use std::sync::OnceLock;
use log::{LevelFilter, Record};
use crate::config::LogTarget;
use crate::error::Failed;
use crate::utils::date::format_local_iso_date;
use crate::utils::sync::Mutex;


//------------ Logger ---------------------------------------------------------

/// Formats and writes log records to their configured destination.
pub struct Logger {
    target: Mutex<LogBackend>,
    log_level: LevelFilter,
}

enum LogBackend {
    #[cfg(unix)]
    Syslog(SyslogLogger),
    File {
        file: fs::File,
        path: PathBuf,
    },
    Stderr {
        stderr: io::Stderr,
    },
}

impl Logger {
    /// Installs the provisional logger.
    ///
    /// Must be called before anything else that might log, since until
    /// [`switch`][Self::switch] is called every message just goes to
    /// stderr without formatting.
    pub fn init() -> Result<(), Failed> {
        log::set_max_level(LevelFilter::Warn);
        if let Err(err) = log::set_logger(&GLOBAL_LOGGER) {
            eprintln!("Failed to initialize logger: {err}.\nAborting.");
            return Err(Failed)
        }
        Ok(())
    }

    /// Switches logging to whatever the configuration asks for.
    ///
    /// Takes the verbosity and target directly rather than a `&Config`
    /// so both binaries in this crate (whose `Config` types otherwise
    /// share nothing) can call it the same way.
    pub fn switch(verbose: LevelFilter, log_target: &LogTarget) -> Result<(), Failed> {
        let logger = Logger::new(verbose, log_target)?;
        GLOBAL_LOGGER.switch(logger);
        log::set_max_level(verbose);
        Ok(())
    }

    fn new(verbose: LevelFilter, log_target: &LogTarget) -> Result<Self, Failed> {
        let target = match *log_target {
            #[cfg(unix)]
            LogTarget::Syslog => Self::new_syslog_target()?,
            LogTarget::File(ref path) => Self::new_file_target(path.clone())?,
            LogTarget::Stderr => LogBackend::Stderr { stderr: io::stderr() },
        };
        Ok(Self { target: Mutex::new(target), log_level: verbose })
    }

    #[cfg(unix)]
    fn new_syslog_target() -> Result<LogBackend, Failed> {
        SyslogLogger::new().map(LogBackend::Syslog)
    }

    fn new_file_target(path: PathBuf) -> Result<LogBackend, Failed> {
        let file = fs::OpenOptions::new().create(true).append(true)
            .open(&path)
            .map_err(|err| {
                log::error!(
                    "Failed to open log file '{}': {}", path.display(), err
                );
                Failed
            })?;
        Ok(LogBackend::File { file, path })
    }

    fn log(&self, record: &Record) {
        if self.should_ignore(record) {
            return;
        }
        if let Err(err) = self.try_log(record) {
            self.log_failure(err);
        }
    }

    fn try_log(&self, record: &Record) -> Result<(), io::Error> {
        match self.target.lock().deref_mut() {
            #[cfg(unix)]
            LogBackend::Syslog(logger) => logger.log(record),
            LogBackend::File { file, .. } => {
                writeln!(
                    file, "[{}] [{}] {}",
                    format_local_iso_date(chrono::Local::now()),
                    record.level(),
                    record.args()
                )
            }
            LogBackend::Stderr { stderr } => {
                writeln!(
                    stderr, "[{}] [{}] {}",
                    format_local_iso_date(chrono::Local::now()),
                    record.level(),
                    record.args()
                )
            }
        }
    }

    fn log_failure(&self, err: io::Error) -> ! {
        eprintln!("Logging failed: {err}. Exiting.");
        process::exit(1)
    }

    fn flush(&self) {
        match self.target.lock().deref_mut() {
            #[cfg(unix)]
            LogBackend::Syslog(logger) => logger.flush(),
            LogBackend::File { file, .. } => { let _ = file.flush(); }
            LogBackend::Stderr { stderr } => { let _ = stderr.lock().flush(); }
        }
    }

    /// Filters out overly chatty messages from dependencies unless we're
    /// at trace level.
    fn should_ignore(&self, record: &Record) -> bool {
        if self.log_level >= LevelFilter::Trace {
            return false
        }
        match record.module_path() {
            Some(module) => {
                record.level() > log::Level::Warn && !module.starts_with(
                    env!("CARGO_PKG_NAME").replace('-', "_").as_str()
                )
            }
            None => false,
        }
    }
}


//------------ SyslogLogger ---------------------------------------------------

#[cfg(unix)]
struct SyslogLogger(
    syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>
);

#[cfg(unix)]
impl SyslogLogger {
    fn new() -> Result<Self, Failed> {
        let process = std::env::current_exe().ok().and_then(|path| {
            path.file_name()
                .and_then(std::ffi::OsStr::to_str)
                .map(ToString::to_string)
        }).unwrap_or_else(|| String::from("ting-rtt"));
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        syslog::unix(formatter).map(Self).map_err(|err| {
            log::error!("Cannot connect to syslog: {err}");
            Failed
        })
    }

    fn log(&mut self, record: &Record) -> Result<(), io::Error> {
        match record.level() {
            log::Level::Error => self.0.err(record.args()),
            log::Level::Warn => self.0.warning(record.args()),
            log::Level::Info => self.0.info(record.args()),
            log::Level::Debug | log::Level::Trace => self.0.debug(record.args()),
        }.map_err(|err| match err {
            syslog::Error::Io(err) => err,
            err => io::Error::other(err),
        })
    }

    fn flush(&mut self) {
        let _ = self.0.backend.flush();
    }
}


//------------ GlobalLogger ---------------------------------------------------

struct GlobalLogger {
    inner: OnceLock<Logger>,
}

static GLOBAL_LOGGER: GlobalLogger = GlobalLogger { inner: OnceLock::new() };

impl GlobalLogger {
    fn switch(&self, logger: Logger) {
        if self.inner.set(logger).is_err() {
            panic!("Tried to switch logger more than once.")
        }
    }
}

impl log::Log for GlobalLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        match self.inner.get() {
            Some(logger) => logger.log(record),
            None => {
                let _ = writeln!(
                    io::stderr().lock(), "[{}] {}",
                    record.level(), record.args()
                );
            }
        }
    }

    fn flush(&self) {
        if let Some(logger) = self.inner.get() {
            logger.flush()
        }
    }
}

//! Central log sink
//!
//! The hub is the logging endpoint for the whole framework: its own records
//! and records shipped by clients over `LOG` messages land in one sink,
//! formatted as `[HH:MM:SS][app][LEVEL] text`. The sink writes to the
//! configured log file and, when no file is set or replication is enabled,
//! to standard output.
//!
//! The configured `log_level` threshold filters the hub's own records
//! only. A client that ships a `LOG` record has already decided it is
//! worth centralizing, so client records are written unconditionally.
//!
//! Hub code logs through the standard `log` macros; [`install`] wires the
//! facade to the sink. Before [`configure`] runs (during config loading)
//! records fall back to standard output unfiltered.
//!
//! Hub levels extend the `log` facade with NORMAL (between INFO and
//! WARNING) and CRITICAL (above ERROR) to match the wire protocol's
//! level integers.

use crate::config::Config;
use chrono::Local;
use log::{LevelFilter, Metadata, Record};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::Write;

/// Log severity, ordered. The wire `LOG` level integer and the `log_level`
/// configuration key both use these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Normal = 2,
    Warning = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// Parse a configuration-file level name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "NORMAL" => Some(Self::Normal),
            "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Map a wire-protocol level integer.
    pub fn from_wire(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Debug),
            1 => Some(Self::Info),
            2 => Some(Self::Normal),
            3 => Some(Self::Warning),
            4 => Some(Self::Error),
            5 => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Normal => "NORMAL",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// The sink itself: level threshold plus output targets.
pub struct LogSink {
    min_level: LogLevel,
    file: Option<Mutex<File>>,
    replicate_stdout: bool,
}

impl LogSink {
    /// Build a sink from configuration. A log file that cannot be opened
    /// falls back to standard output (the hub keeps running).
    pub fn from_config(config: &Config) -> Self {
        let min_level = match LogLevel::from_name(&config.log_level) {
            Some(level) => level,
            None => {
                eprintln!(
                    "Unknown log level '{}', falling back to NORMAL",
                    config.log_level
                );
                LogLevel::Normal
            }
        };

        let path = config.log_file.trim();
        let file = if path.is_empty() {
            None
        } else {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    eprintln!("Could not open log file {}: {}", path, e);
                    None
                }
            }
        };

        Self {
            min_level,
            file,
            replicate_stdout: config.log_replicate_stdout,
        }
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Append one of the hub's own records, subject to the configured
    /// level threshold.
    pub fn append(&self, app: &str, level: LogLevel, text: &str) {
        if level < self.min_level {
            return;
        }
        self.write(app, level, text);
    }

    /// Append a record unconditionally. The level threshold applies to
    /// the hub's own records only; records shipped by client applications
    /// are always written.
    pub fn append_unfiltered(&self, app: &str, level: LogLevel, text: &str) {
        self.write(app, level, text);
    }

    fn write(&self, app: &str, level: LogLevel, text: &str) {
        let line = format_line(app, level, text);
        if let Some(file) = &self.file {
            let mut file = file.lock();
            let _ = writeln!(file, "{}", line);
            let _ = file.flush();
        }
        if self.file.is_none() || self.replicate_stdout {
            println!("{}", line);
        }
    }
}

fn format_line(app: &str, level: LogLevel, text: &str) -> String {
    format!(
        "[{}][{}][{}] {}",
        Local::now().format("%H:%M:%S"),
        app,
        level.name(),
        text
    )
}

static SINK: RwLock<Option<LogSink>> = RwLock::new(None);
static FACADE: Facade = Facade;

/// Forwards `log` facade records into the sink under the hub's own name.
struct Facade;

impl log::Log for Facade {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match SINK.read().as_ref() {
            Some(sink) => facade_level(metadata.level()) >= sink.min_level(),
            None => true,
        }
    }

    fn log(&self, record: &Record) {
        let level = facade_level(record.level());
        let text = record.args().to_string();
        match SINK.read().as_ref() {
            Some(sink) => sink.append("Hub", level, &text),
            // Sink not configured yet: replicate the pre-init stdout
            // behavior so early startup records are not lost.
            None => println!("{}", format_line("Hub", level, &text)),
        }
    }

    fn flush(&self) {}
}

fn facade_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warning,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug | log::Level::Trace => LogLevel::Debug,
    }
}

/// Most verbose facade filter that still reaches `min`: the sink performs
/// the authoritative per-record filtering.
fn facade_filter(min: LogLevel) -> LevelFilter {
    match min {
        LogLevel::Debug => LevelFilter::Trace,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Normal | LogLevel::Warning => LevelFilter::Warn,
        LogLevel::Error | LogLevel::Critical => LevelFilter::Error,
    }
}

/// Install the facade logger. Safe to call more than once; the first call
/// wins. Until [`configure`] runs, records go to standard output.
pub fn install() {
    if log::set_logger(&FACADE).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Point the sink at its configured outputs. Replaces any previous sink.
pub fn configure(config: &Config) {
    let sink = LogSink::from_config(config);
    log::set_max_level(facade_filter(sink.min_level()));
    *SINK.write() = Some(sink);
}

/// Append a record shipped by a client application. Client records are
/// never dropped for severity; the configured threshold only gates the
/// hub's own records.
pub fn client_log(app: &str, level: LogLevel, text: &str) {
    match SINK.read().as_ref() {
        Some(sink) => sink.append_unfiltered(app, level, text),
        None => println!("{}", format_line(app, level, text)),
    }
}

/// Record a CRITICAL condition. These accompany fatal startup errors and
/// protocol refusals, above what the `log` facade can express.
pub fn critical(text: &str) {
    match SINK.read().as_ref() {
        Some(sink) => sink.append("Hub", LogLevel::Critical, text),
        None => println!("{}", format_line("Hub", LogLevel::Critical, text)),
    }
}

//! Pipe-delimited structured file logger shared by both executables.
//!
//! One record per line: `YYYY-MM-DD.HH:MM:SS|LEVEL|[FUNCTION|]MESSAGE`.
//! CR and LF inside a message are escaped to the literal sequences `\r`
//! and `\n` so a record can never span lines. Every record is flushed as
//! it is written; the writer is serialised internally so the
//! multi-threaded proxy can share one logger.

use chrono::Local;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

/// Record severities, in ascending order. `Disabled` suppresses all
/// output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Disabled,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Disabled => "",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown logging level (expected debug | info | warn | error)")]
pub struct ParseLevelError;

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            _ => Err(ParseLevelError),
        }
    }
}

/// Append-only file logger. The minimum level is fixed at construction;
/// write failures are swallowed, logging is best-effort by contract.
pub struct Logger {
    writer: Mutex<BufWriter<File>>,
    min_level: Level,
}

impl Logger {
    /// Opens `path` for appending, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P, min_level: Level) -> io::Result<Logger> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Logger {
            writer: Mutex::new(BufWriter::new(file)),
            min_level,
        })
    }

    pub fn debug(&self, message: &str) {
        self.write(Level::Debug, None, message);
    }

    pub fn info(&self, message: &str) {
        self.write(Level::Info, None, message);
    }

    pub fn warn(&self, message: &str) {
        self.write(Level::Warn, None, message);
    }

    pub fn error(&self, message: &str) {
        self.write(Level::Error, None, message);
    }

    /// As [`debug`](Self::debug), tagged with the producing code path.
    pub fn debug_in(&self, function: &str, message: &str) {
        self.write(Level::Debug, Some(function), message);
    }

    pub fn info_in(&self, function: &str, message: &str) {
        self.write(Level::Info, Some(function), message);
    }

    pub fn warn_in(&self, function: &str, message: &str) {
        self.write(Level::Warn, Some(function), message);
    }

    pub fn error_in(&self, function: &str, message: &str) {
        self.write(Level::Error, Some(function), message);
    }

    fn write(&self, level: Level, function: Option<&str>, message: &str) {
        if level < self.min_level || level == Level::Disabled {
            return;
        }
        let timestamp = Local::now().format("%Y-%m-%d.%H:%M:%S");
        let body = escape(message);
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let written = match function {
            Some(function) => writeln!(writer, "{timestamp}|{level}|{function}|{body}"),
            None => writeln!(writer, "{timestamp}|{level}|{body}"),
        };
        if written.is_ok() {
            let _ = writer.flush();
        }
    }
}

/// CR and LF become literal two-character escapes so a record stays one
/// line.
fn escape(message: &str) -> String {
    message.replace('\r', "\\r").replace('\n', "\\n")
}

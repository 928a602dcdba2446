//! Per-server session log file
//!
//! One text file per server instance, `tcp_<service>.log`, opened in append
//! mode. Every line carries a local timestamp; at the highest level each
//! record is also dumped as hex. On shutdown a summary block with the
//! cumulative counters and the elapsed time closes the session.

use crate::error::{Error, Result};
use crate::server::stats::ServerStats;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Session log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// No session log file
    #[default]
    Off = 0,
    /// Connection events and errors
    Connections = 1,
    /// Plus per-record summaries
    Data = 2,
    /// Plus hex dump of every record
    HexDump = 3,
}

impl TryFrom<u8> for LogLevel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LogLevel::Off),
            1 => Ok(LogLevel::Connections),
            2 => Ok(LogLevel::Data),
            3 => Ok(LogLevel::HexDump),
            _ => Err(Error::InvalidArgument(format!(
                "log level must be 0..=3, got {}",
                value
            ))),
        }
    }
}

/// Direction of a dumped record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Received,
    Sending,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Received => f.write_str("Received"),
            Direction::Sending => f.write_str("Sending"),
        }
    }
}

/// Session log shared by the multiplexing loop and broadcast callers
pub struct SessionLog {
    file: Mutex<File>,
    level: LogLevel,
    path: PathBuf,
    service: String,
    record_size: usize,
    started: Instant,
}

impl SessionLog {
    /// Open `tcp_<service>.log` in `dir` and write the session header
    ///
    /// Returns `Ok(None)` when `level` is [`LogLevel::Off`].
    pub fn open(
        dir: &Path,
        service: &str,
        record_size: usize,
        level: LogLevel,
    ) -> Result<Option<Self>> {
        if level == LogLevel::Off {
            return Ok(None);
        }

        let path = dir.join(format!("tcp_{}.log", service));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                Error::Resource(format!("cannot open log file {}: {}", path.display(), e))
            })?;

        writeln!(
            file,
            "+++ TCP/IP Server on port {} with data size {} +++",
            service, record_size
        )?;
        file.flush()?;

        Ok(Some(Self {
            file: Mutex::new(file),
            level,
            path,
            service: service.to_string(),
            record_size,
            started: Instant::now(),
        }))
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured verbosity
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Write a timestamped line if `level` is enabled
    pub fn event(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if self.level >= level {
            self.write_line(format_args!("{}", args));
        }
    }

    /// Write an error line (enabled at every level above `Off`)
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.write_line(format_args!("!!! error: {}", args));
    }

    /// Hex dump of one record (only at [`LogLevel::HexDump`])
    pub fn dump(&self, direction: Direction, data: &[u8]) {
        if self.level >= LogLevel::HexDump {
            self.write_line(format_args!(
                "{} {} byte(s):{}",
                direction,
                data.len(),
                hex_string(data)
            ));
        }
    }

    /// Append the closing summary block
    pub fn summary(&self, stats: &ServerStats) {
        let mut file = self.file.lock();
        let result = (|| -> std::io::Result<()> {
            writeln!(
                file,
                "+++ Connection summary for TCP/IP Server on port {} with data size {} +++",
                self.service, self.record_size
            )?;
            writeln!(file, "{:11} packet(s) sent to clients", stats.sent)?;
            writeln!(file, "{:11} packet(s) received from clients", stats.received)?;
            writeln!(file, "{:11} packet(s) not processed by the host", stats.lost)?;
            writeln!(
                file,
                "+++ TCP/IP Server terminated: elapsed time {:.4} sec +++",
                self.started.elapsed().as_secs_f64()
            )?;
            file.flush()
        })();

        if let Err(e) = result {
            log::warn!("Failed to write session summary: {}", e);
        }
    }

    fn write_line(&self, args: fmt::Arguments<'_>) {
        let mut file = self.file.lock();
        let result = writeln!(file, "[{}] {}", timestamp(), args).and_then(|_| file.flush());
        if let Err(e) = result {
            log::warn!("Failed to write session log {}: {}", self.path.display(), e);
        }
    }
}

/// Local time with four fractional digits, e.g. `2026-10-18T09:15:02.0421`
fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.4f")
        .to_string()
}

fn hex_string(data: &[u8]) -> String {
    use fmt::Write as _;

    let mut out = String::with_capacity(data.len() * 3);
    for byte in data {
        let _ = write!(out, " {:02X}", byte);
    }
    out
}

//! Daemon log setup
//!
//! Everything goes to the `vilain_log` file in a fixed format that
//! vilainreport reads back:
//!
//! ```text
//! 2024-05-02 13:37:00  INFO vilain::engine::aggregator: Blacklisting 10.0.0.5, reason ssh, return code:0
//! ```

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Timestamp layout expected by vilainreport
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes pending lines to the log file.
pub fn init(log_file: &Path, debug: bool) -> Result<WorkerGuard> {
    let appender = WatchedFile::open(log_file)
        .with_context(|| format!("Failed to open log file: {}", log_file.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()));

    // --debug mirrors the log on stdout
    let stdout_layer = debug.then(|| {
        fmt::layer()
            .with_target(false)
            .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .context("Failed to install log subscriber")?;

    println!("Log file : {}", log_file.display());
    Ok(guard)
}

/// Append-only log file that follows external rotation.
///
/// Before each write the path is checked; when it is gone or now names
/// another file (newsyslog moved it away), the path is reopened so lines keep
/// landing in the current log.
#[derive(Debug)]
pub struct WatchedFile {
    path: PathBuf,
    file: File,
    dev: u64,
    ino: u64,
}

impl WatchedFile {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let meta = file.metadata()?;
        Ok(Self {
            path,
            file,
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    fn reopen_if_rotated(&mut self) -> io::Result<()> {
        let moved = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.dev() != self.dev || meta.ino() != self.ino,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(e),
        };
        if moved {
            self.file.flush()?;
            *self = Self::open(&self.path)?;
        }
        Ok(())
    }
}

impl Write for WatchedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.reopen_if_rotated()?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

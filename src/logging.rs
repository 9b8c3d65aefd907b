//! Tracing setup for the CLI and worker processes.
//!
//! Everything goes to stderr, filtered by `RUST_LOG` (default `warn`) so
//! stdout stays reserved for bridge JSON and the worker protocol. With a
//! debug log path, a second layer appends every `debug` and higher event
//! to that file.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(debug_log: Option<&Path>) {
    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")));

    let file_layer = debug_log.map(|path| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(AppendFile::new(path))
            .with_filter(LevelFilter::DEBUG)
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .ok();
}

/// Opens the file in append mode for every event, so the file can be
/// deleted or recreated underneath a running process. Events are dropped
/// while the file cannot be opened.
#[derive(Debug, Clone)]
pub struct AppendFile {
    path: PathBuf,
}

impl AppendFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl<'a> MakeWriter<'a> for AppendFile {
    type Writer = Box<dyn Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(io::sink()),
        }
    }
}

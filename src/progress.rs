//! Reindex progress reporting.
//!
//! The orchestrator emits a [`ProgressEvent::Scanned`] once the tree has
//! been walked and one [`ProgressEvent::Indexed`] per file after its row is
//! staged. Human progress goes to **stderr**. JSON progress goes to
//! **stdout** as bridge lines (`{"status":"progress","file":...}`) so
//! front ends reading the command's stdout see each file as it lands.

use std::io::Write;
use std::path::{Path, PathBuf};

/// A single progress event for a reindex pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Scan finished: `files` supported files found, `pending` of them new or changed.
    Scanned { files: u64, pending: u64 },
    /// `path` was (re)indexed; `n` of `total` pending files done so far.
    Indexed { path: PathBuf, n: u64, total: u64 },
}

/// Receives progress events from the orchestrator.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "reindex  indexed 12 / 40  /docs/guide.pdf".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanned { files, pending } => format!(
                "reindex  scanned {} files, {} to index\n",
                format_number(*files),
                format_number(*pending)
            ),
            ProgressEvent::Indexed { path, n, total } => format!(
                "reindex  indexed {} / {}  {}\n",
                format_number(*n),
                format_number(*total),
                path.display()
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Bridge progress lines on stdout, one per indexed file.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let ProgressEvent::Indexed { path, .. } = &event else {
            return;
        };
        let obj = serde_json::json!({
            "status": "progress",
            "file": path.to_string_lossy(),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Adapts a per-file callback into a reporter.
pub struct FileCallback<F>(pub F);

impl<F> ProgressReporter for FileCallback<F>
where
    F: Fn(&Path) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        if let ProgressEvent::Indexed { path, .. } = &event {
            (self.0)(path);
        }
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stdout).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

//! Operator-facing activity log (`loop.log` in the state directory).
//!
//! # Separation of Concerns
//!
//! - **Tracing (`logging`)**: debug diagnostics via `RUST_LOG`, output to stderr.
//! - **Operator log (this module)**: what a person watering the garden reads:
//!   valve transitions, skips, stops, and the next scheduled program. Always
//!   written, unaffected by `RUST_LOG`, exposed to remote viewers.
//!
//! The log only grows. Rotation is left to the host (e.g. logrotate with
//! `copytruncate`); the loop itself only reads the tail of the file.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use tracing::warn;

/// Bytes read from the end of `loop.log` to find the last line.
const TAIL_BYTES: u64 = 4096;

static LINE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2} (?:INFO|WARNING|ERROR): ").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

/// Operator-facing log sink.
///
/// Writes are best-effort: a failing sink must never abort actuation.
pub trait OperatorLog {
    fn record(&self, level: Level, message: &str);

    /// Entire accumulated log text.
    fn contents(&self) -> Result<String>;

    fn info(&self, message: &str) {
        self.record(Level::Info, message);
    }

    fn warning(&self, message: &str) {
        self.record(Level::Warning, message);
    }

    fn error(&self, message: &str) {
        self.record(Level::Error, message);
    }

    /// Message text of the most recent line, without its timestamp and level.
    fn last_message(&self) -> Result<Option<String>> {
        Ok(last_line(&self.contents()?))
    }
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(strip_prefix)
}

/// Remove the `YYYY-MM-DD HH:MM:SS LEVEL: ` prefix from a log line.
pub fn strip_prefix(line: &str) -> String {
    LINE_PREFIX.replace(line, "").into_owned()
}

/// Operator log appended to a file, one timestamped line per message.
#[derive(Debug, Clone)]
pub struct FileOperatorLog {
    path: PathBuf,
}

impl FileOperatorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("append {}", self.path.display()))
    }

    /// Last `TAIL_BYTES` of the file, starting at a line boundary.
    fn tail(&self) -> Result<String> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(String::new()),
            Err(err) => return Err(err).with_context(|| format!("open {}", self.path.display())),
        };
        let len = file
            .metadata()
            .with_context(|| format!("stat {}", self.path.display()))?
            .len();
        let start = len.saturating_sub(TAIL_BYTES);
        file.seek(SeekFrom::Start(start))
            .with_context(|| format!("seek {}", self.path.display()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .with_context(|| format!("read {}", self.path.display()))?;

        let text = String::from_utf8_lossy(&buf);
        if start == 0 {
            return Ok(text.into_owned());
        }
        // The first line is cut off unless it starts exactly at `start`.
        Ok(text
            .split_once('\n')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default())
    }
}

impl OperatorLog for FileOperatorLog {
    fn record(&self, level: Level, message: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("{stamp} {}: {message}", level.as_str());
        if let Err(err) = self.append(&line) {
            warn!(err = %err, path = %self.path.display(), "operator log write failed");
        }
    }

    fn contents(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err).with_context(|| format!("read {}", self.path.display())),
        }
    }

    fn last_message(&self) -> Result<Option<String>> {
        Ok(last_line(&self.tail()?))
    }
}

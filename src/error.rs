//! Error taxonomy and the persistent error log.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The build graph (including implicit edges) is not acyclic.
    #[error("cycle in build graph: {from} -> {to}")]
    Cycle { from: String, to: String },

    /// Malformed build description or depfile.
    #[error("parse error: {path}: {msg}")]
    Parse { path: String, msg: String },

    #[error("unknown target {0:?}")]
    TargetNotFound(String),

    #[error("command for {target} failed: {status}")]
    CommandFailure { target: String, status: String },

    #[error("source {0:?} is missing")]
    MissingSource(String),

    #[error("cache: {0}")]
    CacheIo(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn parse(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Parse {
            path: path.into(),
            msg: msg.into(),
        }
    }

    /// Stable name of the variant, used on the RPC wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Cycle { .. } => "CycleError",
            Error::Parse { .. } => "ParseError",
            Error::TargetNotFound(_) => "TargetNotFound",
            Error::CommandFailure { .. } => "CommandFailure",
            Error::MissingSource(_) => "MissingSourceError",
            Error::CacheIo(_) => "CacheIOError",
            Error::Io(_) => "IOError",
        }
    }
}

/// Append-only log of build and startup errors.
/// The file is only created once something is recorded, so its presence is
/// itself a signal that an error happened.
pub struct ErrorLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ErrorLog {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an error.  Failing to write the log is itself only logged.
    pub fn record(&self, err: &Error) {
        tracing::error!("{}", err);
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.append(err) {
            tracing::warn!("write {}: {}", self.path.display(), e);
        }
    }

    fn append(&self, err: &Error) -> std::io::Result<()> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "[{}] {}: {}", secs, err.kind(), err)
    }
}

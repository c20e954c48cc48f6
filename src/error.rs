//! Error types for the bundle preparation pipeline.
//!
//! Every failure is an [`Error`]: a classified [`ErrorKind`] plus a trace of
//! `{file, line, message}` entries accumulated as the error bubbles up. The
//! trace replaces an exception stack: callers decide locally whether to
//! enrich the error with [`Context::context`] or surface it as-is. The kind
//! stays stable across enrichment so the CLI can map it to an exit code.

use std::fmt;
use std::panic::Location;
use std::path::PathBuf;

/// Result type alias for the launcher.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification, stable across context enrichment.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// Malformed CLI mount/device request or image reference.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Admin configuration is malformed or names unusable directories.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A path exists but is of the wrong kind (or does not exist at all).
    #[error("{}: {detail}", .path.display())]
    PathKind { path: PathBuf, detail: String },

    /// A kernel mount operation failed.
    #[error("failed to mount {}: {errno}", .target.display())]
    OsMount { target: PathBuf, errno: nix::Error },

    /// fork/exec/prctl or another process-control syscall failed.
    #[error("failed to spawn OCI runtime: {0}")]
    OsSpawn(String),

    /// Neither the CLI nor the image metadata yielded an argv.
    #[error("no command to execute in the container")]
    NoCommand,

    /// The OCI runtime ran but exited nonzero; the status is propagated.
    #[error("OCI runtime exited with status {0}")]
    RuntimeFailure(i32),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One hop of an error's journey through the pipeline.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub file: &'static str,
    pub line: u32,
    pub message: String,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file, self.line, self.message)
    }
}

/// An error kind plus the trace of context entries attached on the way up.
///
/// The first trace entry is recorded where the error originates; callers
/// append further entries with [`Error::context`] or [`Context::context`].
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    trace: Vec<TraceEntry>,
}

impl Error {
    /// Creates an error, recording the caller as the origin of the trace.
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        let location = Location::caller();
        let message = kind.to_string();
        Self {
            kind,
            trace: vec![TraceEntry {
                file: location.file(),
                line: location.line(),
                message,
            }],
        }
    }

    /// The failure classification.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The accumulated trace, origin first.
    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Appends a context entry recorded at the caller's location.
    #[track_caller]
    pub fn context(mut self, message: impl Into<String>) -> Self {
        self.push_entry(Location::caller(), message.into());
        self
    }

    /// Renders the whole trace, one entry per line, origin first.
    pub fn format_trace(&self) -> String {
        let mut out = String::new();
        for entry in &self.trace {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&entry.to_string());
        }
        out
    }

    fn push_entry(&mut self, location: &'static Location<'static>, message: String) {
        self.trace.push(TraceEntry {
            file: location.file(),
            line: location.line(),
            message,
        });
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    #[track_caller]
    fn from(err: E) -> Self {
        Error::new(ErrorKind::from(err))
    }
}

/// Extension trait attaching trace context to `Result`s.
pub trait Context<T> {
    /// Appends `message` to the error trace, recorded at the caller.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Like [`Context::context`] but the message is built only on failure.
    fn with_context<F>(self, message: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[track_caller]
    fn context(self, message: impl Into<String>) -> Result<T> {
        let location = Location::caller();
        self.map_err(|err| {
            let mut err = err.into();
            err.push_entry(location, message.into());
            err
        })
    }

    #[track_caller]
    fn with_context<F>(self, message: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        let location = Location::caller();
        self.map_err(|err| {
            let mut err = err.into();
            err.push_entry(location, message());
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_is_first_trace_entry() {
        let err = Error::new(ErrorKind::NoCommand);
        assert_eq!(err.trace().len(), 1);
        assert!(err.trace()[0].message.contains("no command"));
        assert!(err.trace()[0].file.ends_with("error.rs"));
    }

    #[test]
    fn context_appends_entries_in_order() {
        let err = Error::new(ErrorKind::InvalidRequest("bad".into()))
            .context("while parsing a device request")
            .context("while assembling the run command");
        let messages: Vec<_> = err.trace().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages.len(), 3);
        assert!(messages[1].contains("device request"));
        assert!(messages[2].contains("run command"));
    }

    #[test]
    fn kind_survives_enrichment() {
        let err: Error = Error::new(ErrorKind::RuntimeFailure(42)).context("extra");
        assert!(matches!(err.kind(), ErrorKind::RuntimeFailure(42)));
    }
}

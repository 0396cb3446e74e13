//! Error taxonomy for the orchestration layer
//!
//! Transport- and process-level failures are never silently retried; they
//! surface with enough context (underlying cause, last known state) for the
//! caller to decide whether to restart the server.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::language::Language;

#[derive(Error, Debug)]
pub enum Error {
    /// The requested language identifier is not registered.
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    /// The language server executable could not be found or started.
    #[error("failed to launch '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The wire stream produced a frame that cannot be decoded. Fatal to the
    /// session: there is no safe way to resynchronize on a byte stream.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// No response arrived within the per-call budget. The request id is
    /// retired; a late response is discarded. The session stays usable.
    #[error("request '{method}' timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    /// The server returned an explicit JSON-RPC error object.
    #[error("server error {code}: {message}")]
    RequestFailure { code: i32, message: String },

    /// The caller cancelled the request before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The subprocess exited while the session was live. All outstanding
    /// requests resolve with this.
    #[error("language server process crashed")]
    ProcessCrashed,

    /// The session is unusable (protocol desync, closed reader, ...).
    #[error("session failure: {0}")]
    SessionFailure(String),

    /// Startup did not complete; the partially-started process has already
    /// been terminated.
    #[error("server startup failed: {source}")]
    Startup {
        #[source]
        source: Box<Error>,
    },

    /// One live server per (language, repository root) pair.
    #[error("a {language} server is already running for {}", root.display())]
    AlreadyRunning { language: Language, root: PathBuf },

    /// Operation requires a running, initialized session.
    #[error("session is not ready (state: {0})")]
    NotReady(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a startup-phase failure.
    pub(crate) fn startup(source: Error) -> Self {
        Error::Startup {
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

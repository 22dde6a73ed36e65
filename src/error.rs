//! Error types for the runner.
//!
//! These cover everything that stops a run before a verdict can be reached.
//! A run that completes but does not satisfy its directives is reported as a
//! [`crate::verify::Failure`] instead.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The test case or the stdin redirection file does not exist.
    #[error("{} not found", path.display())]
    InputNotFound { path: PathBuf },

    /// An `# EXIT` directive whose payload is not a base-10 integer.
    #[error("malformed EXIT directive on line {line}: {payload:?} is not an integer")]
    MalformedDirective { line: usize, payload: String },

    #[error("failed to launch {}: {source}", exe.display())]
    Launch {
        exe: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("process timed out after {limit:?}")]
    Timeout { limit: Duration },

    #[error("failed to load config {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

//! Crate-wide error types
//!
//! Each subsystem has its own error enum; `Error` wraps them so that `?`
//! works across module boundaries.

use std::fmt;
use std::io;

pub use crate::pipeline::error::PipelineError;
pub use crate::relay::error::RelayError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O failure from a source or sink
    Io(io::Error),
    /// Stream relay failure (join, tailing, writer)
    Relay(RelayError),
    /// Ordered pipeline failure
    Pipeline(PipelineError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Relay(e) => write!(f, "Relay error: {}", e),
            Error::Pipeline(e) => write!(f, "Pipeline error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Relay(e) => Some(e),
            Error::Pipeline(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<RelayError> for Error {
    fn from(e: RelayError) -> Self {
        Error::Relay(e)
    }
}

impl From<PipelineError> for Error {
    fn from(e: PipelineError) -> Self {
        Error::Pipeline(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: Error = RelayError::NoValidStartFound.into();
        assert_eq!(
            err.to_string(),
            "Relay error: No valid start marker found in buffer"
        );

        let err: Error = PipelineError::AlreadyRunning.into();
        assert_eq!(err.to_string(), "Pipeline error: Pipeline is already running");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}

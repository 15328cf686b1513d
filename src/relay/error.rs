//! Relay error types
//!
//! Error types for ring writing, consumer joins and tailing.

use std::io;

/// Error type for relay operations
#[derive(Debug, Clone)]
pub enum RelayError {
    /// Join found no start-of-frame marker in the live window
    NoValidStartFound,
    /// The writer lapped a tailer; unread data has been overwritten
    BufferOverrun { lag: u64, capacity: usize },
    /// A discrete frame does not fit in the ring at all
    FrameTooLarge { len: usize, capacity: usize },
    /// The consumer sink reported closed
    SinkClosed,
    /// The consumer sink failed a write
    Sink(io::ErrorKind, String),
    /// The byte source failed a read
    Source(io::ErrorKind, String),
    /// The byte source did not produce data within the read timeout
    SourceTimeout,
    /// The multiplexer is already running
    AlreadyRunning,
    /// The multiplexer has not been started
    NotRunning,
    /// The multiplexer has been stopped
    Stopped,
}

impl RelayError {
    /// Whether the error only concerns a single consumer
    pub fn is_consumer_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::NoValidStartFound
                | RelayError::BufferOverrun { .. }
                | RelayError::SinkClosed
                | RelayError::Sink(..)
        )
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::NoValidStartFound => write!(f, "No valid start marker found in buffer"),
            RelayError::BufferOverrun { lag, capacity } => {
                write!(f, "Buffer overrun: {} bytes behind, capacity {}", lag, capacity)
            }
            RelayError::FrameTooLarge { len, capacity } => {
                write!(f, "Frame of {} bytes exceeds capacity {}", len, capacity)
            }
            RelayError::SinkClosed => write!(f, "Sink closed"),
            RelayError::Sink(kind, msg) => write!(f, "Sink write failed ({:?}): {}", kind, msg),
            RelayError::Source(kind, msg) => write!(f, "Source read failed ({:?}): {}", kind, msg),
            RelayError::SourceTimeout => write!(f, "Source read timed out"),
            RelayError::AlreadyRunning => write!(f, "Multiplexer is already running"),
            RelayError::NotRunning => write!(f, "Multiplexer is not running"),
            RelayError::Stopped => write!(f, "Multiplexer stopped"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero => RelayError::SinkClosed,
            kind => RelayError::Sink(kind, e.to_string()),
        }
    }
}

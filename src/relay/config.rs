//! Relay configuration

use std::time::Duration;

use crate::media::StreamFormat;

/// Default ring capacity (4MB)
pub const DEFAULT_CAPACITY: usize = 4 * 1024 * 1024;

/// Default source read size (16KB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default tailer idle poll, roughly one frame at 60fps
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(16);

/// Relay configuration options
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Ring buffer capacity in bytes
    pub capacity: usize,

    /// Bytes requested from the source per read
    pub chunk_size: usize,

    /// How long an idle tailer sleeps before polling again
    pub poll_interval: Duration,

    /// Source reads taking longer than this stop the writer
    pub read_timeout: Duration,

    /// Capacity of the relay event channel
    pub event_capacity: usize,

    /// Encoded stream format, decides the join marker
    pub format: StreamFormat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_timeout: Duration::from_secs(5),
            event_capacity: 64,
            format: StreamFormat::h264(),
        }
    }
}

impl RelayConfig {
    /// Create a new config for a stream format
    pub fn with_format(format: StreamFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }

    /// Set the ring capacity
    ///
    /// The chunk size is re-clamped so a chunk never exceeds a quarter of
    /// the ring.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self.chunk_size = self.chunk_size.min(self.max_chunk_size());
        self
    }

    /// Set the source read size
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(1, self.max_chunk_size());
        self
    }

    /// Set the idle poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the source read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Set the stream format
    pub fn format(mut self, format: StreamFormat) -> Self {
        self.format = format;
        self
    }

    fn max_chunk_size(&self) -> usize {
        (self.capacity / 4).max(1)
    }
}

//! Shared-buffer multiplexer configuration

use crate::media::StreamFormat;
use crate::pipeline::PipelineConfig;
use crate::relay::RelayConfig;

/// Default number of encoded frames kept for frame readers
pub const DEFAULT_SLOT_CAPACITY: usize = 32;

/// Shared-buffer multiplexer configuration options
#[derive(Debug, Clone)]
pub struct SharedBufferConfig {
    /// Ring and tailer settings; the format defaults to MJPEG
    pub relay: RelayConfig,

    /// Encoder pipeline settings
    pub pipeline: PipelineConfig,

    /// Slots in the encoded-frame buffer
    pub slot_capacity: usize,
}

impl Default for SharedBufferConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::with_format(StreamFormat::Mjpeg),
            pipeline: PipelineConfig::new("encode"),
            slot_capacity: DEFAULT_SLOT_CAPACITY,
        }
    }
}

impl SharedBufferConfig {
    pub fn relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Set the encoded-frame slot count (minimum 2)
    pub fn slot_capacity(mut self, slots: usize) -> Self {
        self.slot_capacity = slots.max(2);
        self
    }
}

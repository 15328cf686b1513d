//! framecast: live video fan-out
//!
//! Two paths feed the same consumer machinery:
//!
//! ```text
//!   encoded byte stream ──> StreamMultiplexer ──┐
//!                                               ├──> RingByteBuffer ──> StreamTailer ──> sink
//!   raw frames ──> OrderedPipeline (encode) ────┘         (one per consumer: raw, multipart, websocket)
//!              (SharedBufferMultiplexer)
//! ```
//!
//! - [`relay`]: one writer, many independent tailers over a byte ring.
//!   Late joiners start at the most recent key frame; a tailer that falls
//!   more than a ring's worth behind is disconnected, never fed corrupt data.
//! - [`pipeline`]: bounded parallel transform with strictly ordered
//!   delivery. Excess items are dropped rather than queued.
//! - [`shared`]: frame source to encoded fan-out, combining the two.
//! - [`buffer`]: the ring and the slotted cyclic buffer underneath.
//!
//! # Example
//!
//! ```no_run
//! use framecast::relay::{RawSink, RelayConfig, StreamMultiplexer};
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> framecast::error::Result<()> {
//! let mux = StreamMultiplexer::new(RelayConfig::default());
//! let camera = TcpStream::connect("10.0.0.7:5000").await?;
//! mux.start(camera)?;
//!
//! let viewer = TcpStream::connect("10.0.0.9:6000").await?;
//! let handle = mux.join(RawSink::new(viewer))?;
//! handle.closed().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod relay;
pub mod shared;
pub mod stats;

pub use buffer::{RingByteBuffer, SlottedCyclicBuffer};
pub use error::{Error, Result};
pub use pipeline::{OrderedPipeline, PipelineConfig};
pub use relay::{RelayConfig, StreamMultiplexer};
pub use shared::{SharedBufferConfig, SharedBufferMultiplexer};

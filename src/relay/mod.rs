//! Byte-stream fan-out
//!
//! One writer fills a [`RingByteBuffer`](crate::buffer::RingByteBuffer) from
//! a live source; each consumer gets a tailer that joins at a safe start
//! marker and chases the writer at its own pace.
//!
//! # Architecture
//!
//! ```text
//!                          ┌────────────────────────────┐
//!                          │     StreamMultiplexer      │
//!   ByteSource ──────────> │ writer ──> RingByteBuffer  │
//!                          │                            │
//!                          │  TailerRegistry            │
//!                          │   ├─ StreamTailer<RawSink> ├──> socket
//!                          │   ├─ StreamTailer<Multi..> ├──> HTTP body
//!                          │   └─ StreamTailer<WebSo..> ├──> WebSocket
//!                          └────────────────────────────┘
//! ```
//!
//! # Failure isolation
//!
//! A failed join, an overrun or a sink error ends only the affected tailer.
//! A source failure stops the writer and closes every tailer.

pub mod config;
pub mod error;
pub mod multiplexer;
pub mod registry;
pub mod sink;
pub mod tailer;

pub use config::RelayConfig;
pub use error::RelayError;
pub use multiplexer::{ByteSource, StreamMultiplexer};
pub use registry::{DisconnectReason, RelayEvent, TailerHandle, TailerRegistry};
pub use sink::{MessageTransport, MultipartSink, RawSink, StreamSink, WebSocketSink, WsMessage};
pub use tailer::{StreamTailer, TailerMetrics};

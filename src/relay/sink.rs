//! Consumer sinks
//!
//! A tailer forwards contiguous slices of the ring to a [`StreamSink`]. The
//! tailing algorithm is the same for every consumer; sinks differ only in
//! how a slice is framed on the wire:
//!
//! - [`RawSink`]: bytes copied as-is (TCP socket, pipe, file)
//! - [`MultipartSink`]: `multipart/x-mixed-replace` parts, one validated
//!   JPEG image per part
//! - [`WebSocketSink`]: one binary message per slice

use std::future::Future;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::media::jpeg::{self, JpegMarker, JpegScanner, SOI};

/// Default multipart boundary token
pub const DEFAULT_BOUNDARY: &str = "framecastboundary";

/// Default largest image a [`MultipartSink`] reassembles (4 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Destination for a tailer's forwarded bytes
pub trait StreamSink: Send + 'static {
    /// Write one slice; the slice is fully handed off when this resolves
    fn write(&mut self, data: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush and close the underlying transport
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Copies slices to an `AsyncWrite` unchanged
#[derive(Debug)]
pub struct RawSink<W> {
    inner: W,
}

impl<W> RawSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> StreamSink for RawSink<W> {
    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        self.inner.write_all(&data).await?;
        self.inner.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Frames an MJPEG byte stream as `multipart/x-mixed-replace`
///
/// Slices do not line up with images, so the sink reassembles complete
/// images with a forward [`JpegScanner`] and emits one part per image. An
/// image that fails single-frame validation, or grows past
/// [`max_frame_len`](Self::max_frame_len) without an end marker, is logged
/// and skipped; the connection stays up.
#[derive(Debug)]
pub struct MultipartSink<W> {
    inner: W,
    boundary: String,
    scanner: JpegScanner,
    frame: BytesMut,
    in_frame: bool,
    max_frame_len: usize,
    frames_sent: u64,
    frames_rejected: u64,
}

impl<W> MultipartSink<W> {
    pub fn new(inner: W) -> Self {
        Self::with_boundary(inner, DEFAULT_BOUNDARY)
    }

    pub fn with_boundary(inner: W, boundary: impl Into<String>) -> Self {
        Self {
            inner,
            boundary: boundary.into(),
            scanner: JpegScanner::forward(),
            frame: BytesMut::new(),
            in_frame: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            frames_sent: 0,
            frames_rejected: 0,
        }
    }

    /// Largest image to reassemble; longer images are discarded
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len.max(SOI.len());
        self
    }

    /// Value for the response `Content-Type` header
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Feed a slice and collect every image it completes
    fn collect_frames(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut complete = Vec::new();

        for &b in data {
            if self.in_frame {
                self.frame.put_u8(b);
                if self.frame.len() > self.max_frame_len {
                    self.frames_rejected += 1;
                    tracing::warn!(
                        limit = self.max_frame_len,
                        rejected = self.frames_rejected,
                        "Discarding oversized JPEG frame"
                    );
                    self.frame.clear();
                    self.in_frame = false;
                }
            }

            match self.scanner.feed_marker(b) {
                Some(JpegMarker::Start) => {
                    // A new SOI discards any unterminated image
                    self.frame.clear();
                    self.frame.extend_from_slice(&SOI);
                    self.in_frame = true;
                }
                Some(JpegMarker::End) if self.in_frame => {
                    complete.push(self.frame.split().freeze());
                    self.in_frame = false;
                }
                _ => {}
            }
        }

        complete
    }

    fn part(&self, frame: &[u8]) -> Bytes {
        let header = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            self.boundary,
            frame.len()
        );

        let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
        part.put_slice(header.as_bytes());
        part.put_slice(frame);
        part.put_slice(b"\r\n");
        part.freeze()
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> StreamSink for MultipartSink<W> {
    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        for frame in self.collect_frames(&data) {
            if !jpeg::is_single_frame(&frame) {
                self.frames_rejected += 1;
                tracing::warn!(
                    len = frame.len(),
                    rejected = self.frames_rejected,
                    "Skipping malformed JPEG frame"
                );
                continue;
            }

            let part = self.part(&frame);
            self.inner.write_all(&part).await?;
            self.frames_sent += 1;
        }

        self.inner.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        let trailer = format!("--{}--\r\n", self.boundary);
        self.inner.write_all(trailer.as_bytes()).await?;
        self.inner.shutdown().await
    }
}

/// Message handed to a WebSocket transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Binary(Bytes),
    Close,
}

/// Send half of a WebSocket connection
///
/// Kept minimal so any WebSocket library can sit behind it.
pub trait MessageTransport: Send + 'static {
    fn send(&mut self, message: WsMessage) -> impl Future<Output = io::Result<()>> + Send;
}

impl MessageTransport for mpsc::Sender<WsMessage> {
    async fn send(&mut self, message: WsMessage) -> io::Result<()> {
        mpsc::Sender::send(self, message)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "websocket receiver dropped"))
    }
}

/// Sends each slice as exactly one binary message
#[derive(Debug)]
pub struct WebSocketSink<T> {
    transport: T,
}

impl<T> WebSocketSink<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: MessageTransport> StreamSink for WebSocketSink<T> {
    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        self.transport.send(WsMessage::Binary(data)).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.transport.send(WsMessage::Close).await
    }
}

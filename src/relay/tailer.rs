//! Stream tailer
//!
//! A tailer chases the ring writer on behalf of one consumer. It resolves a
//! safe starting point once, then loops: read whatever the writer has
//! appended since the last read, hand it to the sink, sleep briefly when
//! caught up. Errors end this tailer only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::error::RelayError;
use super::sink::StreamSink;
use crate::buffer::{RingByteBuffer, RingCursor};
use crate::media::BoundaryScanner;
use crate::stats::TailerStats;

/// Live counters shared between a running tailer and its handle
#[derive(Debug)]
pub struct TailerMetrics {
    id: u64,
    started_total: u64,
    joined_at: Instant,
    bytes_forwarded: AtomicU64,
    slices: AtomicU64,
}

impl TailerMetrics {
    fn new(id: u64, started_total: u64) -> Self {
        Self {
            id,
            started_total,
            joined_at: Instant::now(),
            bytes_forwarded: AtomicU64::new(0),
            slices: AtomicU64::new(0),
        }
    }

    fn record(&self, len: usize) {
        self.bytes_forwarded.fetch_add(len as u64, Ordering::Relaxed);
        self.slices.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot against the current state of `ring`
    pub fn snapshot(&self, ring: &RingByteBuffer) -> TailerStats {
        let bytes_forwarded = self.bytes_forwarded.load(Ordering::Relaxed);
        TailerStats {
            id: self.id,
            started_total: self.started_total,
            bytes_forwarded,
            slices: self.slices.load(Ordering::Relaxed),
            pending: ring
                .total_written()
                .saturating_sub(self.started_total + bytes_forwarded),
            uptime: self.joined_at.elapsed(),
        }
    }
}

/// One consumer chasing the ring writer
pub struct StreamTailer<S> {
    id: u64,
    ring: Arc<RingByteBuffer>,
    cursor: RingCursor,
    sink: S,
    poll_interval: Duration,
    metrics: Arc<TailerMetrics>,
}

impl<S: StreamSink> StreamTailer<S> {
    /// Resolve a join point with `scanner` and build a tailer there
    ///
    /// Fails with [`RelayError::NoValidStartFound`] when the live window
    /// holds no start marker. Nothing is forwarded before this succeeds.
    pub fn join(
        id: u64,
        ring: Arc<RingByteBuffer>,
        sink: S,
        scanner: &mut dyn BoundaryScanner,
        poll_interval: Duration,
    ) -> Result<Self, RelayError> {
        let cursor = ring.find_join_point(scanner)?;
        Ok(Self::at(id, ring, cursor, sink, poll_interval))
    }

    /// Build a tailer at an already resolved cursor
    pub fn at(
        id: u64,
        ring: Arc<RingByteBuffer>,
        cursor: RingCursor,
        sink: S,
        poll_interval: Duration,
    ) -> Self {
        let metrics = Arc::new(TailerMetrics::new(id, cursor.started_total()));
        Self {
            id,
            ring,
            cursor,
            sink,
            poll_interval,
            metrics,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cursor(&self) -> &RingCursor {
        &self.cursor
    }

    pub fn metrics(&self) -> &Arc<TailerMetrics> {
        &self.metrics
    }

    /// Forward data until cancelled or failed, then close the sink
    ///
    /// Returns `Ok(())` on cancellation. Overruns and sink failures are
    /// returned as errors after the sink has been closed.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), RelayError> {
        tracing::debug!(
            tailer_id = self.id,
            started_total = self.cursor.started_total(),
            pending = self.ring.pending(&self.cursor),
            "Tailer started"
        );

        let result = self.forward(&cancel).await;

        if let Err(e) = self.sink.close().await {
            tracing::debug!(tailer_id = self.id, error = %e, "Sink close failed");
        }

        match &result {
            Ok(()) => tracing::debug!(
                tailer_id = self.id,
                forwarded = self.cursor.written(),
                "Tailer cancelled"
            ),
            Err(e @ RelayError::BufferOverrun { .. }) => tracing::warn!(
                tailer_id = self.id,
                forwarded = self.cursor.written(),
                error = %e,
                "Tailer overrun"
            ),
            Err(e) => tracing::debug!(
                tailer_id = self.id,
                forwarded = self.cursor.written(),
                error = %e,
                "Tailer failed"
            ),
        }

        result
    }

    async fn forward(&mut self, cancel: &CancellationToken) -> Result<(), RelayError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let slice = match self.ring.read(&mut self.cursor)? {
                Some(slice) => slice,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                }
            };

            let len = slice.len();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                res = self.sink.write(slice) => res?,
            }

            self.metrics.record(len);
            tracing::trace!(
                tailer_id = self.id,
                len = len,
                forwarded = self.cursor.written(),
                "Slice forwarded"
            );
        }
    }
}

impl<S> std::fmt::Debug for StreamTailer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTailer")
            .field("id", &self.id)
            .field("cursor", &self.cursor)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::media::JpegScanner;
    use crate::relay::sink::{WebSocketSink, WsMessage};

    /// Sink that records every slice and can be told to fail
    struct RecordingSink {
        slices: mpsc::UnboundedSender<Bytes>,
        fail_after: Option<usize>,
        closed: Arc<AtomicU64>,
    }

    impl StreamSink for RecordingSink {
        async fn write(&mut self, data: Bytes) -> io::Result<()> {
            if let Some(n) = self.fail_after.as_mut() {
                if *n == 0 {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
                }
                *n -= 1;
            }
            let _ = self.slices.send(data);
            Ok(())
        }

        async fn close(&mut self) -> io::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn recording(
        fail_after: Option<usize>,
    ) -> (RecordingSink, mpsc::UnboundedReceiver<Bytes>, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicU64::new(0));
        let sink = RecordingSink {
            slices: tx,
            fail_after,
            closed: Arc::clone(&closed),
        };
        (sink, rx, closed)
    }

    const POLL: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn test_forwards_writes_in_order() {
        let ring = Arc::new(RingByteBuffer::new(64));
        let (sink, mut rx, _) = recording(None);
        let tailer = StreamTailer::at(1, Arc::clone(&ring), ring.cursor_at_head(), sink, POLL);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tailer.run(cancel.clone()));

        ring.write(b"one ");
        ring.write(b"two ");
        ring.write(b"three");

        let mut received = Vec::new();
        while received.len() < 13 {
            let slice = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            received.extend_from_slice(&slice);
        }
        assert_eq!(received, b"one two three");

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_join_without_marker_fails() {
        let ring = Arc::new(RingByteBuffer::new(32));
        ring.write(b"no markers here");
        let (sink, _rx, closed) = recording(None);

        let result = StreamTailer::join(
            1,
            ring,
            sink,
            &mut JpegScanner::reverse(),
            POLL,
        );
        assert!(matches!(result, Err(RelayError::NoValidStartFound)));
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_join_starts_at_latest_marker() {
        let ring = Arc::new(RingByteBuffer::new(64));
        ring.write(&[0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);
        ring.write(&[0xFF, 0xD8, 3, 4]);

        let (tx, mut rx) = mpsc::channel(8);
        let tailer = StreamTailer::join(
            9,
            Arc::clone(&ring),
            WebSocketSink::new(tx),
            &mut JpegScanner::reverse(),
            POLL,
        )
        .unwrap();
        assert_eq!(tailer.cursor().started_total(), 6);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tailer.run(cancel.clone()));

        let first = rx.recv().await.unwrap();
        assert_eq!(first, WsMessage::Binary(Bytes::from_static(&[0xFF, 0xD8, 3, 4])));

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(WsMessage::Close));
    }

    #[tokio::test]
    async fn test_sink_failure_ends_tailer() {
        let ring = Arc::new(RingByteBuffer::new(64));
        let (sink, _rx, closed) = recording(Some(0));
        let tailer = StreamTailer::at(2, Arc::clone(&ring), ring.cursor_at_head(), sink, POLL);
        let handle = tokio::spawn(tailer.run(CancellationToken::new()));

        ring.write(b"boom");

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::SinkClosed)));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lapped_tailer_reports_overrun() {
        let ring = Arc::new(RingByteBuffer::new(8));
        let (sink, _rx, closed) = recording(None);
        let tailer = StreamTailer::at(3, Arc::clone(&ring), ring.cursor_at_head(), sink, POLL);

        // Lap the ring before the tailer gets to run
        ring.write(b"abcd");
        ring.write(b"efgh");
        ring.write(b"ijkl");

        let result = tailer.run(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(RelayError::BufferOverrun { lag: 12, capacity: 8 })
        ));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_metrics_track_forwarding() {
        let ring = Arc::new(RingByteBuffer::new(64));
        let (sink, mut rx, _) = recording(None);
        let tailer = StreamTailer::at(4, Arc::clone(&ring), ring.cursor_at_head(), sink, POLL);
        let metrics = Arc::clone(tailer.metrics());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tailer.run(cancel.clone()));
        ring.write(b"12345");
        rx.recv().await.unwrap();

        cancel.cancel();
        handle.await.unwrap().unwrap();

        let stats = metrics.snapshot(&ring);
        assert_eq!(stats.id, 4);
        assert_eq!(stats.bytes_forwarded, 5);
        assert_eq!(stats.slices, 1);
        assert_eq!(stats.pending, 0);
    }
}

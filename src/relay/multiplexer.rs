//! Stream multiplexer
//!
//! Owns one ring, the single writer task filling it from a byte source, and
//! the registry of tailers reading from it.
//!
//! ```text
//!   ByteSource ──read──> writer task ──write──> RingByteBuffer
//!                                                  │
//!                          ┌───────────────────────┼──────────────┐
//!                          v                       v              v
//!                      tailer 1                tailer 2  ...  tailer N
//!                          │                       │              │
//!                        sink                    sink           sink
//! ```
//!
//! A source error, EOF or read timeout stops the writer; every tailer is
//! then closed and [`RelayEvent::Stopped`] is broadcast.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::RelayConfig;
use super::error::RelayError;
use super::registry::{RelayEvent, TailerHandle, TailerRegistry};
use super::sink::StreamSink;
use crate::buffer::RingByteBuffer;
use crate::media::BoundaryScanner;
use crate::stats::{RelayStats, TailerStats};

/// Raw byte source feeding a multiplexer
///
/// A read returning 0 bytes is end of stream.
pub trait ByteSource: AsyncRead + Unpin + Send + 'static {}

impl<T: AsyncRead + Unpin + Send + 'static> ByteSource for T {}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Why the writer loop ended
#[derive(Debug)]
enum WriterExit {
    Cancelled,
    EndOfStream,
    Failed(RelayError),
}

/// One writer, many tailers
pub struct StreamMultiplexer {
    config: RelayConfig,
    registry: Arc<TailerRegistry>,
    state: AtomicU8,
    cancel: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
    frames_seen: Arc<AtomicU64>,
    started_at: Mutex<Option<Instant>>,
}

impl StreamMultiplexer {
    pub fn new(config: RelayConfig) -> Self {
        let ring = Arc::new(RingByteBuffer::new(config.capacity));
        let registry = Arc::new(TailerRegistry::new(ring, &config));

        Self {
            config,
            registry,
            state: AtomicU8::new(IDLE),
            cancel: CancellationToken::new(),
            writer: Mutex::new(None),
            frames_seen: Arc::new(AtomicU64::new(0)),
            started_at: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn ring(&self) -> &Arc<RingByteBuffer> {
        self.registry.ring()
    }

    /// Whether the writer loop is live
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING && !self.registry.is_shutdown()
    }

    /// Launch the writer loop over `source`
    ///
    /// A multiplexer runs once; starting it again fails.
    pub fn start<R: ByteSource>(&self, source: R) -> Result<(), RelayError> {
        match self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RUNNING) => return Err(RelayError::AlreadyRunning),
            Err(_) => return Err(RelayError::Stopped),
        }

        *self.started_at.lock() = Some(Instant::now());

        let writer = Writer {
            ring: Arc::clone(self.registry.ring()),
            scanner: self.config.format.forward_scanner(),
            chunk_size: self.config.chunk_size,
            read_timeout: self.config.read_timeout,
            frames_seen: Arc::clone(&self.frames_seen),
        };
        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();

        tracing::info!(
            capacity = self.config.capacity,
            chunk_size = self.config.chunk_size,
            format = %self.config.format,
            "Multiplexer started"
        );

        let handle = tokio::spawn(async move {
            let exit = writer.run(source, &cancel).await;
            match &exit {
                WriterExit::Cancelled => tracing::info!("Writer cancelled"),
                WriterExit::EndOfStream => tracing::info!("Writer reached end of stream"),
                WriterExit::Failed(e) => tracing::warn!(error = %e, "Writer stopped"),
            }
            registry.shutdown().await;
        });
        *self.writer.lock() = Some(handle);

        Ok(())
    }

    /// Stop the writer and close every tailer
    pub async fn stop(&self) -> Result<(), RelayError> {
        let previous = self.state.swap(STOPPED, Ordering::AcqRel);
        if previous == STOPPED {
            return Err(RelayError::NotRunning);
        }

        self.cancel.cancel();
        let writer = self.writer.lock().take();
        match writer {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Writer task panicked");
                    self.registry.shutdown().await;
                }
            }
            None => self.registry.shutdown().await,
        }

        tracing::info!(
            total_written = self.ring().total_written(),
            frames_seen = self.frames_seen.load(Ordering::Relaxed),
            "Multiplexer stopped"
        );
        Ok(())
    }

    /// Attach a consumer at the most recent start marker
    pub fn join<S: StreamSink>(&self, sink: S) -> Result<TailerHandle, RelayError> {
        self.registry.join(sink)
    }

    /// Attach a consumer using a caller-supplied reverse scanner
    pub fn join_with<S: StreamSink>(
        &self,
        sink: S,
        scanner: &mut dyn BoundaryScanner,
    ) -> Result<TailerHandle, RelayError> {
        self.registry.join_with(sink, scanner)
    }

    pub fn disconnect(&self, id: u64) -> bool {
        self.registry.disconnect(id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.registry.subscribe_events()
    }

    pub fn tailer_count(&self) -> usize {
        self.registry.active_count()
    }

    pub fn tailer_stats(&self) -> Vec<TailerStats> {
        self.registry.tailer_stats()
    }

    pub fn stats(&self) -> RelayStats {
        let mut stats = self.registry.stats();
        stats.frames_seen = self.frames_seen.load(Ordering::Relaxed);
        if let Some(started) = *self.started_at.lock() {
            stats.uptime = started.elapsed();
        }
        stats
    }
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("format", &self.config.format)
            .field("running", &self.is_running())
            .field("ring", self.registry.ring())
            .field("tailers", &self.registry.active_count())
            .finish()
    }
}

/// State owned by the writer task
struct Writer {
    ring: Arc<RingByteBuffer>,
    scanner: Box<dyn BoundaryScanner>,
    chunk_size: usize,
    read_timeout: Duration,
    frames_seen: Arc<AtomicU64>,
}

impl Writer {
    async fn run<R: ByteSource>(mut self, mut source: R, cancel: &CancellationToken) -> WriterExit {
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return WriterExit::Cancelled,
                read = tokio::time::timeout(self.read_timeout, source.read(&mut buf)) => read,
            };

            let n = match read {
                Ok(Ok(0)) => return WriterExit::EndOfStream,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return WriterExit::Failed(RelayError::Source(e.kind(), e.to_string())),
                Err(_) => return WriterExit::Failed(RelayError::SourceTimeout),
            };

            let chunk = &buf[..n];
            self.ring.write(chunk);
            self.count_frames(chunk);
        }
    }

    fn count_frames(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if self.scanner.feed(b).is_some() {
                let seen = self.frames_seen.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(
                    frames_seen = seen,
                    total_written = self.ring.total_written(),
                    "Frame start"
                );
            }
        }
    }
}

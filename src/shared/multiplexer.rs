//! Shared-buffer multiplexer
//!
//! Composition root for the frame case: raw frames are pulled from a
//! [`FrameSource`], encoded in parallel by an [`OrderedPipeline`] (one
//! [`FrameEncoder`] per worker), and the ordered output is written both to
//! a frame-mode [`RingByteBuffer`] served to byte tailers and to a
//! [`SlottedCyclicBuffer`] for whole-frame readers.
//!
//! ```text
//!   FrameSource ──> dispatcher ──> encoders (N) ──> merger ─┬─> RingByteBuffer ──> tailers
//!                                                           └─> SlottedCyclicBuffer ──> frame readers
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::config::SharedBufferConfig;
use super::frame::{EncodedFrame, RawFrame};
use crate::buffer::{RingByteBuffer, SlotReader, SlottedCyclicBuffer};
use crate::error::{Error, Result};
use crate::pipeline::{
    OrderedPipeline, Outcome, PipelineStats, RunningPipeline, Work, WorkSource,
};
use crate::relay::{RelayError, RelayEvent, StreamSink, TailerHandle, TailerRegistry};
use crate::stats::{RelayStats, TailerStats};

/// Supplies captured frames, typically from shared memory
pub trait FrameSource: Send + 'static {
    /// Next frame, or `None` if nothing arrived within `timeout`
    fn next_frame(&mut self, cancel: &CancellationToken, timeout: Duration) -> Option<RawFrame>;
}

impl FrameSource for Receiver<RawFrame> {
    fn next_frame(&mut self, _cancel: &CancellationToken, timeout: Duration) -> Option<RawFrame> {
        match self.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                None
            }
        }
    }
}

/// Encoder owned by exactly one pipeline worker
///
/// Implementations may keep scratch buffers or a native codec handle; the
/// pipeline never shares one encoder between two frames at once.
pub trait FrameEncoder: Send + 'static {
    fn encode(
        &mut self,
        frame: &RawFrame,
        prev: Option<&RawFrame>,
        cancel: &CancellationToken,
    ) -> io::Result<Bytes>;
}

struct FrameFeed<F>(F);

impl<F: FrameSource> WorkSource<RawFrame> for FrameFeed<F> {
    fn next_item(&mut self, cancel: &CancellationToken, timeout: Duration) -> Option<RawFrame> {
        self.0.next_frame(cancel, timeout)
    }
}

#[derive(Debug, Default)]
struct FrameCounters {
    published: AtomicU64,
    encode_failures: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time view of a [`SharedBufferMultiplexer`]
#[derive(Debug, Clone)]
pub struct SharedBufferStats {
    pub relay: RelayStats,
    pub pipeline: PipelineStats,
    /// Encoded frames written to the ring and frame buffer
    pub frames_published: u64,
    /// Frames whose encoder returned an error
    pub encode_failures: u64,
    /// Encoded frames too large for the ring
    pub rejected_frames: u64,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Frame source, encoder pipeline and tailers behind one handle
pub struct SharedBufferMultiplexer<E: FrameEncoder> {
    config: SharedBufferConfig,
    registry: Arc<TailerRegistry>,
    frames: Arc<SlottedCyclicBuffer<EncodedFrame>>,
    pipeline: OrderedPipeline<RawFrame, E, EncodedFrame>,
    running: Mutex<Option<RunningPipeline<E, EncodedFrame>>>,
    state: AtomicU8,
    cancel: CancellationToken,
    counters: Arc<FrameCounters>,
}

impl<E: FrameEncoder> SharedBufferMultiplexer<E> {
    pub fn new(config: SharedBufferConfig) -> Self {
        let ring = Arc::new(RingByteBuffer::new(config.relay.capacity));
        let registry = Arc::new(TailerRegistry::new(ring, &config.relay));
        let frames = Arc::new(SlottedCyclicBuffer::new(config.slot_capacity.max(2)));
        let pipeline = OrderedPipeline::new(config.pipeline.clone());

        Self {
            config,
            registry,
            frames,
            pipeline,
            running: Mutex::new(None),
            state: AtomicU8::new(IDLE),
            cancel: CancellationToken::new(),
            counters: Arc::new(FrameCounters::default()),
        }
    }

    pub fn config(&self) -> &SharedBufferConfig {
        &self.config
    }

    pub fn ring(&self) -> &Arc<RingByteBuffer> {
        self.registry.ring()
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Call `callback` with every `k`th raw frame, before it is encoded
    ///
    /// Register before [`start`](Self::start).
    pub fn subscribe_every<F>(&mut self, k: u64, callback: F)
    where
        F: Fn(&RawFrame, u64) + Send + Sync + 'static,
    {
        self.pipeline.subscribe_every(k, callback);
    }

    /// Start encoding frames from `source`
    ///
    /// `encoders(worker_index)` is called once per worker. Must be called
    /// inside a tokio runtime.
    pub fn start<S, F>(&self, source: S, encoders: F) -> Result<()>
    where
        S: FrameSource,
        F: FnMut(usize) -> E,
    {
        match self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RUNNING) => return Err(RelayError::AlreadyRunning.into()),
            Err(_) => return Err(RelayError::Stopped.into()),
        }

        let counters = Arc::clone(&self.counters);
        let transform = move |work: Work<RawFrame>, encoder: &mut E| -> Outcome<EncodedFrame> {
            match encoder.encode(&work.item, work.prev.as_deref(), &work.cancel) {
                Ok(data) => Outcome::Done(EncodedFrame {
                    seq: work.seq,
                    timestamp: work.item.header().timestamp,
                    data,
                }),
                Err(_) if work.cancel.is_cancelled() => Outcome::Cancelled,
                Err(e) => {
                    counters.encode_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(seq = work.seq, worker_id = work.worker_id, error = %e, "Frame encode failed");
                    Outcome::Failed
                }
            }
        };

        let ring = Arc::clone(self.registry.ring());
        let frames = Arc::clone(&self.frames);
        let counters = Arc::clone(&self.counters);
        let sink = move |frame: EncodedFrame, _cancel: &CancellationToken| {
            if let Err(e) = ring.write_frame(&frame.data) {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(seq = frame.seq, error = %e, "Encoded frame rejected");
                return;
            }
            tracing::trace!(seq = frame.seq, len = frame.len(), "Frame published");
            frames.append(frame);
            counters.published.fetch_add(1, Ordering::Relaxed);
        };

        match self
            .pipeline
            .start(FrameFeed(source), transform, sink, encoders)
        {
            Ok(running) => {
                *self.running.lock() = Some(running);
                tracing::info!(
                    capacity = self.config.relay.capacity,
                    slots = self.frames.capacity(),
                    workers = self.config.pipeline.max_parallel_items,
                    "Shared buffer multiplexer started"
                );
                Ok(())
            }
            Err(e) => {
                self.state.store(IDLE, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Stop encoding, then close every tailer and frame reader
    ///
    /// Frames already encoded are merged before the tailers close.
    pub async fn stop(&self) -> Result<PipelineStats> {
        if self.state.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return Err(RelayError::NotRunning.into());
        }

        let running = self.running.lock().take();
        let stats = match running {
            Some(running) => match tokio::task::spawn_blocking(move || running.stop()).await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::error!(error = %e, "Pipeline stop panicked");
                    self.pipeline.stats()
                }
            },
            None => self.pipeline.stats(),
        };

        self.cancel.cancel();
        self.registry.shutdown().await;

        tracing::info!(
            published = self.counters.published.load(Ordering::Relaxed),
            dropped = stats.dropped,
            out_of_order = stats.out_of_order,
            "Shared buffer multiplexer stopped"
        );
        Ok(stats)
    }

    /// Attach a byte consumer at the most recent encoded frame
    pub fn join<S: StreamSink>(&self, sink: S) -> Result<TailerHandle> {
        self.registry.join(sink).map_err(Error::from)
    }

    /// Independent reader over whole encoded frames
    ///
    /// The reader ends when the multiplexer stops.
    pub fn frames(&self) -> SlotReader<EncodedFrame> {
        self.frames.read(self.cancel.child_token())
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

    pub fn stats(&self) -> SharedBufferStats {
        let frames_published = self.counters.published.load(Ordering::Relaxed);
        let mut relay = self.registry.stats();
        relay.frames_seen = frames_published;

        SharedBufferStats {
            relay,
            pipeline: self.pipeline.stats(),
            frames_published,
            encode_failures: self.counters.encode_failures.load(Ordering::Relaxed),
            rejected_frames: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

impl<E: FrameEncoder> Drop for SharedBufferMultiplexer<E> {
    fn drop(&mut self) {
        self.cancel.cancel();

        let Some(running) = self.running.get_mut().take() else {
            return;
        };
        // Stopping joins threads and waits for workers; keep that off the
        // async worker threads
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || drop(running));
            }
            Err(_) => drop(running),
        }
    }
}

impl<E: FrameEncoder> std::fmt::Debug for SharedBufferMultiplexer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferMultiplexer")
            .field("running", &self.is_running())
            .field("ring", self.registry.ring())
            .field("frames", &self.frames)
            .field("tailers", &self.registry.active_count())
            .finish()
    }
}

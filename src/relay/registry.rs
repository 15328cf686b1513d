//! Tailer registry
//!
//! Tracks the tailers attached to one ring. Each tailer runs on its own
//! task with a child of the registry's cancellation token; when it exits
//! for any reason it deregisters itself and a [`RelayEvent`] is broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::RelayConfig;
use super::error::RelayError;
use super::sink::StreamSink;
use super::tailer::{StreamTailer, TailerMetrics};
use crate::buffer::RingByteBuffer;
use crate::media::{BoundaryScanner, StreamFormat};
use crate::stats::{RelayStats, TailerStats};

/// Why a tailer left the relay
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Disconnected by id or through its handle
    Requested,
    /// The relay shut down
    Shutdown,
    /// Overrun or sink failure
    Failed(RelayError),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "requested"),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
            DisconnectReason::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Relay lifecycle notification
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A tailer resolved its join point and started forwarding
    Joined { id: u64, started_total: u64 },
    /// A tailer was removed
    Disconnected { id: u64, reason: DisconnectReason },
    /// The writer stopped and every tailer was closed
    Stopped,
}

struct TailerEntry {
    cancel: CancellationToken,
    metrics: Arc<TailerMetrics>,
    task: JoinHandle<()>,
}

/// Caller's handle to a running tailer
#[derive(Debug, Clone)]
pub struct TailerHandle {
    id: u64,
    cancel: CancellationToken,
    done: CancellationToken,
    metrics: Arc<TailerMetrics>,
    ring: Arc<RingByteBuffer>,
}

impl TailerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stats(&self) -> TailerStats {
        self.metrics.snapshot(&self.ring)
    }

    /// Whether the tailer has exited and closed its sink
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Wait until the tailer has exited and closed its sink
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    /// Ask the tailer to stop
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

/// Set of tailers attached to one ring
pub struct TailerRegistry {
    ring: Arc<RingByteBuffer>,
    tailers: Mutex<HashMap<u64, TailerEntry>>,
    next_id: AtomicU64,
    events: broadcast::Sender<RelayEvent>,
    cancel: CancellationToken,
    format: StreamFormat,
    poll_interval: Duration,
    joins: AtomicU64,
    failed_joins: AtomicU64,
    disconnects: AtomicU64,
    overruns: AtomicU64,
}

impl TailerRegistry {
    pub fn new(ring: Arc<RingByteBuffer>, config: &RelayConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            ring,
            tailers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            cancel: CancellationToken::new(),
            format: config.format,
            poll_interval: config.poll_interval,
            joins: AtomicU64::new(0),
            failed_joins: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    pub fn ring(&self) -> &Arc<RingByteBuffer> {
        &self.ring
    }

    /// Attach a consumer, joining at the stream format's start marker
    pub fn join<S: StreamSink>(self: &Arc<Self>, sink: S) -> Result<TailerHandle, RelayError> {
        let mut scanner = self.format.reverse_scanner();
        self.join_with(sink, &mut scanner)
    }

    /// Attach a consumer, joining at the marker recognised by `scanner`
    ///
    /// Must be called within a tokio runtime.
    pub fn join_with<S: StreamSink>(
        self: &Arc<Self>,
        sink: S,
        scanner: &mut dyn BoundaryScanner,
    ) -> Result<TailerHandle, RelayError> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::Stopped);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tailer = match StreamTailer::join(
            id,
            Arc::clone(&self.ring),
            sink,
            scanner,
            self.poll_interval,
        ) {
            Ok(tailer) => tailer,
            Err(e) => {
                self.failed_joins.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    tailer_id = id,
                    total_written = self.ring.total_written(),
                    error = %e,
                    "Tailer join refused"
                );
                return Err(e);
            }
        };

        let started_total = tailer.cursor().started_total();
        let metrics = Arc::clone(tailer.metrics());
        let cancel = self.cancel.child_token();
        let done = CancellationToken::new();

        let mut tailers = self.tailers.lock();
        if self.cancel.is_cancelled() {
            return Err(RelayError::Stopped);
        }

        let registry = Arc::clone(self);
        let token = cancel.clone();
        let finished = done.clone();
        let task = tokio::spawn(async move {
            let result = tailer.run(token).await;
            registry.on_exit(id, result);
            finished.cancel();
        });

        tailers.insert(
            id,
            TailerEntry {
                cancel: cancel.clone(),
                metrics: Arc::clone(&metrics),
                task,
            },
        );
        let active = tailers.len();
        drop(tailers);

        self.joins.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            tailer_id = id,
            started_total = started_total,
            tailers = active,
            "Tailer joined"
        );
        let _ = self.events.send(RelayEvent::Joined { id, started_total });

        Ok(TailerHandle {
            id,
            cancel,
            done,
            metrics,
            ring: Arc::clone(&self.ring),
        })
    }

    /// Remove a tailer; returns false if it is not registered
    ///
    /// Other tailers and the writer are unaffected.
    pub fn disconnect(&self, id: u64) -> bool {
        let Some(entry) = self.tailers.lock().remove(&id) else {
            return false;
        };

        entry.cancel.cancel();
        self.record_disconnect(id, DisconnectReason::Requested);
        true
    }

    fn on_exit(&self, id: u64, result: Result<(), RelayError>) {
        // Already removed by disconnect or close_all
        if self.tailers.lock().remove(&id).is_none() {
            return;
        }

        let reason = match result {
            Ok(()) => DisconnectReason::Requested,
            Err(e) => DisconnectReason::Failed(e),
        };
        self.record_disconnect(id, reason);
    }

    fn record_disconnect(&self, id: u64, reason: DisconnectReason) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        if matches!(
            reason,
            DisconnectReason::Failed(RelayError::BufferOverrun { .. })
        ) {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }

        tracing::info!(tailer_id = id, reason = %reason, "Tailer disconnected");
        let _ = self.events.send(RelayEvent::Disconnected { id, reason });
    }

    /// Close every tailer and wait for their sinks to close
    pub async fn close_all(&self) {
        let entries: Vec<(u64, TailerEntry)> = self.tailers.lock().drain().collect();

        for (id, entry) in &entries {
            entry.cancel.cancel();
            self.record_disconnect(*id, DisconnectReason::Shutdown);
        }

        for (id, entry) in entries {
            if let Err(e) = entry.task.await {
                tracing::error!(tailer_id = id, error = %e, "Tailer task panicked");
            }
        }
    }

    /// Refuse new joins, close every tailer and announce the stop
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.close_all().await;
        let _ = self.events.send(RelayEvent::Stopped);
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.tailers.lock().len()
    }

    pub fn tailer_stats(&self) -> Vec<TailerStats> {
        let mut stats: Vec<TailerStats> = self
            .tailers
            .lock()
            .values()
            .map(|entry| entry.metrics.snapshot(&self.ring))
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Ring and registry counters; writer-side fields are left at zero
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            capacity: self.ring.capacity(),
            total_written: self.ring.total_written(),
            padding: self.ring.padding(),
            active_tailers: self.active_count(),
            joins: self.joins.load(Ordering::Relaxed),
            failed_joins: self.failed_joins.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            ..RelayStats::new(self.ring.capacity())
        }
    }
}

impl std::fmt::Debug for TailerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailerRegistry")
            .field("format", &self.format)
            .field("tailers", &self.active_count())
            .field("shutdown", &self.cancel.is_cancelled())
            .finish()
    }
}

//! Ordered parallel pipeline
//!
//! ```text
//!              dispatcher thread            blocking pool            merger thread
//!  source ──> seq = 1, 2, 3 ... ──lease──> transform(item, prev) ──> completion set
//!               │                             │                          │
//!               └─ N in flight: drop          └─ lease returned          └─ sort by seq,
//!                                                                          forward if newer
//! ```
//!
//! Sequence numbers are assigned at dispatch. The merger is the only
//! ordering authority: it forwards a result only when its sequence is
//! greater than the last one forwarded, so the sink always observes a
//! strictly increasing sequence. A result overtaken by a later one is
//! counted as out of order and discarded.
//!
//! At most `max_parallel_items` items are in flight, counting results that
//! wait in the completion set for a slow sink. An item that arrives at the
//! limit, or while no worker state is free, is dropped, never queued.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::config::PipelineConfig;
use super::error::PipelineError;
use super::metrics::{PipelineMetrics, PipelineStats};
use super::pool::{WorkerLease, WorkerPool};

/// One unit of work handed to a transform
#[derive(Debug)]
pub struct Work<I> {
    pub item: Arc<I>,
    /// The item received just before this one, dispatched or not
    pub prev: Option<Arc<I>>,
    pub seq: u64,
    pub worker_id: usize,
    pub cancel: CancellationToken,
}

/// Supplies raw work items to the dispatcher
pub trait WorkSource<I>: Send + 'static {
    /// Next item, or `None` if nothing arrived within `timeout`
    fn next_item(&mut self, cancel: &CancellationToken, timeout: Duration) -> Option<I>;
}

impl<I, F> WorkSource<I> for F
where
    F: FnMut(&CancellationToken) -> Option<I> + Send + 'static,
{
    fn next_item(&mut self, cancel: &CancellationToken, _timeout: Duration) -> Option<I> {
        self(cancel)
    }
}

/// Work source fed through a standard channel
#[derive(Debug)]
pub struct ChannelSource<I> {
    rx: Receiver<I>,
}

impl<I> ChannelSource<I> {
    pub fn new(rx: Receiver<I>) -> Self {
        Self { rx }
    }
}

impl<I: Send + 'static> WorkSource<I> for ChannelSource<I> {
    fn next_item(&mut self, _cancel: &CancellationToken, timeout: Duration) -> Option<I> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                None
            }
        }
    }
}

/// How a transform settled its item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<O> {
    /// Result handed to the merger
    Done(O),
    /// The transform observed cancellation
    Cancelled,
    /// The transform could not produce a result; counted as failed
    Failed,
}

impl<O> From<Option<O>> for Outcome<O> {
    fn from(output: Option<O>) -> Self {
        match output {
            Some(output) => Outcome::Done(output),
            None => Outcome::Cancelled,
        }
    }
}

/// Per-item work, run concurrently on distinct worker states
///
/// Closures may return `Option<O>`, where `None` means cancelled, or an
/// [`Outcome`] when they need to report a failure.
pub trait Transform<I, S, O>: Send + Sync + 'static {
    fn transform(&self, work: Work<I>, state: &mut S) -> Outcome<O>;
}

impl<I, S, O, F, R> Transform<I, S, O> for F
where
    F: Fn(Work<I>, &mut S) -> R + Send + Sync + 'static,
    R: Into<Outcome<O>>,
{
    fn transform(&self, work: Work<I>, state: &mut S) -> Outcome<O> {
        self(work, state).into()
    }
}

/// Receives results in strictly increasing sequence order
pub trait MergeSink<O>: Send + 'static {
    fn merge(&mut self, output: O, cancel: &CancellationToken);
}

impl<O, F> MergeSink<O> for F
where
    F: FnMut(O, &CancellationToken) + Send + 'static,
{
    fn merge(&mut self, output: O, cancel: &CancellationToken) {
        self(output, cancel)
    }
}

type Callback<I> = Arc<dyn Fn(&I, u64) + Send + Sync>;
type Predicate = Arc<dyn Fn(u64) -> bool + Send + Sync>;

enum Stride {
    Every(u64),
    When(Predicate),
}

struct Subscription<I> {
    stride: Stride,
    callback: Callback<I>,
}

impl<I> Subscription<I> {
    fn matches(&self, seq: u64) -> bool {
        match &self.stride {
            Stride::Every(k) => seq % k == 0,
            Stride::When(pred) => pred(seq),
        }
    }
}

impl<I> Clone for Subscription<I> {
    fn clone(&self) -> Self {
        let stride = match &self.stride {
            Stride::Every(k) => Stride::Every(*k),
            Stride::When(pred) => Stride::When(Arc::clone(pred)),
        };
        Self {
            stride,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Unordered results waiting for the merger
struct Completions<O> {
    results: Mutex<Vec<(u64, O)>>,
    ready: Condvar,
}

impl<O> Completions<O> {
    fn new() -> Self {
        Self {
            results: Mutex::new(Vec::new()),
            ready: Condvar::new(),
        }
    }

    fn push(&self, seq: u64, output: O) {
        self.results.lock().push((seq, output));
        self.ready.notify_one();
    }

    fn wait_drain(&self, timeout: Duration) -> Vec<(u64, O)> {
        let mut results = self.results.lock();
        if results.is_empty() {
            let _ = self.ready.wait_for(&mut results, timeout);
        }
        std::mem::take(&mut *results)
    }

    fn wake(&self) {
        self.ready.notify_all();
    }
}

/// Bounded-parallelism pipeline that delivers results in dispatch order
pub struct OrderedPipeline<I, S, O> {
    config: PipelineConfig,
    running: Arc<AtomicBool>,
    metrics: Arc<PipelineMetrics>,
    subscriptions: Vec<Subscription<I>>,
    _types: PhantomData<fn() -> (S, O)>,
}

impl<I, S, O> OrderedPipeline<I, S, O>
where
    I: Send + Sync + 'static,
    S: Send + 'static,
    O: Send + 'static,
{
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(PipelineMetrics::new()),
            subscriptions: Vec::new(),
            _types: PhantomData,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn stats(&self) -> PipelineStats {
        self.metrics.snapshot()
    }

    /// Call `callback` for every `k`th dispatched item
    ///
    /// Callbacks run on the blocking pool and never delay dispatch. Takes
    /// effect on the next start.
    pub fn subscribe_every<F>(&mut self, k: u64, callback: F)
    where
        F: Fn(&I, u64) + Send + Sync + 'static,
    {
        self.subscriptions.push(Subscription {
            stride: Stride::Every(k.max(1)),
            callback: Arc::new(callback),
        });
    }

    /// Call `callback` for every dispatched item whose sequence satisfies
    /// `predicate`
    pub fn subscribe_when<P, F>(&mut self, predicate: P, callback: F)
    where
        P: Fn(u64) -> bool + Send + Sync + 'static,
        F: Fn(&I, u64) + Send + Sync + 'static,
    {
        self.subscriptions.push(Subscription {
            stride: Stride::When(Arc::new(predicate)),
            callback: Arc::new(callback),
        });
    }

    /// Start dispatching from `source`
    ///
    /// Creates `max_parallel_items` worker states with `state_factory`,
    /// then spawns the dispatcher and merger threads. Must be called inside
    /// a tokio runtime; workers run on its blocking pool.
    pub fn start<Src, T, K, F>(
        &self,
        source: Src,
        transform: T,
        sink: K,
        state_factory: F,
    ) -> Result<RunningPipeline<S, O>, PipelineError>
    where
        Src: WorkSource<I>,
        T: Transform<I, S, O>,
        K: MergeSink<O>,
        F: FnMut(usize) -> S,
    {
        self.config.validate()?;
        let handle = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::AlreadyRunning);
        }

        self.metrics.reset();
        let workers = self.config.max_parallel_items;
        let pool = Arc::new(WorkerPool::new(workers, state_factory));
        let completions = Arc::new(Completions::new());
        let cancel = CancellationToken::new();
        let finishing = Arc::new(AtomicBool::new(false));

        let mut running = RunningPipeline {
            name: self.config.name.clone(),
            cancel: cancel.clone(),
            running: Arc::clone(&self.running),
            finishing: Arc::clone(&finishing),
            pool: Arc::clone(&pool),
            completions: Arc::clone(&completions),
            metrics: Arc::clone(&self.metrics),
            dispatcher: None,
            merger: None,
            stopped: false,
        };

        let merger = Merger {
            sink,
            completions: Arc::clone(&completions),
            metrics: Arc::clone(&self.metrics),
            cancel: cancel.clone(),
            finishing,
            merge_wait: self.config.merge_wait,
            last: None,
        };
        // Dropping `running` on error stops whatever was spawned
        running.merger = Some(
            thread::Builder::new()
                .name(format!("{}-merge", self.config.name))
                .spawn(move || merger.run())?,
        );

        let dispatcher = Dispatcher {
            source,
            transform: Arc::new(transform),
            pool,
            completions,
            metrics: Arc::clone(&self.metrics),
            cancel,
            handle,
            subscriptions: self.subscriptions.clone(),
            source_poll: self.config.source_poll,
        };
        running.dispatcher = Some(
            thread::Builder::new()
                .name(format!("{}-dispatch", self.config.name))
                .spawn(move || dispatcher.run())?,
        );

        tracing::info!(
            pipeline = %self.config.name,
            workers = workers,
            subscriptions = self.subscriptions.len(),
            "Pipeline started"
        );
        Ok(running)
    }
}

impl<I, S, O> std::fmt::Debug for OrderedPipeline<I, S, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedPipeline")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// A started pipeline; stopping consumes it
///
/// Dropping it stops the pipeline as well, and blocks the dropping thread
/// the same way [`stop`](Self::stop) does. From async code, move it into
/// `spawn_blocking` before dropping or stopping it.
pub struct RunningPipeline<S: Send, O> {
    name: String,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    finishing: Arc<AtomicBool>,
    pool: Arc<WorkerPool<S>>,
    completions: Arc<Completions<O>>,
    metrics: Arc<PipelineMetrics>,
    dispatcher: Option<thread::JoinHandle<()>>,
    merger: Option<thread::JoinHandle<()>>,
    stopped: bool,
}

impl<S: Send, O> RunningPipeline<S, O> {
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn stats(&self) -> PipelineStats {
        self.metrics.snapshot()
    }

    /// Worker states currently leased
    pub fn busy_workers(&self) -> usize {
        self.pool.leased()
    }

    /// Token cancelled when the pipeline begins stopping
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop and wait for every stage to exit
    ///
    /// Cancels, joins the dispatcher, waits for in-flight workers to
    /// return their states, then lets the merger drain and joins it.
    /// Blocks the calling thread.
    pub fn stop(mut self) -> PipelineStats {
        self.shutdown();
        self.metrics.snapshot()
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.cancel.cancel();

        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                tracing::error!(pipeline = %self.name, "Dispatcher thread panicked");
            }
        }

        while !self.pool.wait_idle(Duration::from_secs(1)) {
            tracing::debug!(
                pipeline = %self.name,
                busy = self.pool.leased(),
                "Waiting for workers to drain"
            );
        }

        self.finishing.store(true, Ordering::Release);
        self.completions.wake();
        if let Some(merger) = self.merger.take() {
            if merger.join().is_err() {
                tracing::error!(pipeline = %self.name, "Merger thread panicked");
            }
        }

        self.running.store(false, Ordering::Release);

        let stats = self.metrics.snapshot();
        tracing::info!(
            pipeline = %self.name,
            received = stats.received,
            delivered = stats.delivered,
            dropped = stats.dropped,
            out_of_order = stats.out_of_order,
            failed = stats.failed,
            "Pipeline stopped"
        );
    }
}

impl<S: Send, O> Drop for RunningPipeline<S, O> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: Send, O> std::fmt::Debug for RunningPipeline<S, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningPipeline")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("stopping", &self.cancel.is_cancelled())
            .finish()
    }
}

struct Dispatcher<I, S: Send, O, Src, T> {
    source: Src,
    transform: Arc<T>,
    pool: Arc<WorkerPool<S>>,
    completions: Arc<Completions<O>>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
    handle: Handle,
    subscriptions: Vec<Subscription<I>>,
    source_poll: Duration,
}

impl<I, S, O, Src, T> Dispatcher<I, S, O, Src, T>
where
    I: Send + Sync + 'static,
    S: Send + 'static,
    O: Send + 'static,
    Src: WorkSource<I>,
    T: Transform<I, S, O>,
{
    fn run(mut self) {
        let mut prev: Option<Arc<I>> = None;
        let mut next_seq: u64 = 1;
        let limit = self.pool.size() as u64;

        while !self.cancel.is_cancelled() {
            let Some(item) = self.source.next_item(&self.cancel, self.source_poll) else {
                continue;
            };
            if self.cancel.is_cancelled() {
                break;
            }

            let item = Arc::new(item);
            self.metrics.received.fetch_add(1, Ordering::AcqRel);

            // Results parked for a slow sink still count against the limit
            let lease = if self.metrics.in_flight() < limit {
                self.pool.try_lease()
            } else {
                None
            };

            match lease {
                Some(lease) => {
                    let seq = next_seq;
                    next_seq += 1;
                    self.dispatch(lease, Arc::clone(&item), prev.take(), seq);
                }
                None => {
                    let dropped = self.metrics.dropped.fetch_add(1, Ordering::AcqRel) + 1;
                    tracing::debug!(dropped = dropped, limit = limit, "Pipeline full, item dropped");
                }
            }

            prev = Some(item);
        }

        tracing::debug!(dispatched = next_seq - 1, "Dispatcher exited");
    }

    fn dispatch(&self, lease: WorkerLease<S>, item: Arc<I>, prev: Option<Arc<I>>, seq: u64) {
        self.metrics.dispatched.fetch_add(1, Ordering::AcqRel);

        for sub in self.subscriptions.iter().filter(|s| s.matches(seq)) {
            let callback = Arc::clone(&sub.callback);
            let item = Arc::clone(&item);
            self.handle.spawn_blocking(move || callback(&item, seq));
        }

        let transform = Arc::clone(&self.transform);
        let completions = Arc::clone(&self.completions);
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();

        self.handle.spawn_blocking(move || {
            // Declared first so the state returns only after the result is
            // in the completion set
            let mut lease = lease;
            let mut guard = SettleGuard {
                metrics: Arc::clone(&metrics),
                seq,
                settled: false,
            };

            let worker_id = lease.id();
            let started = Instant::now();
            let outcome = match lease.state_mut() {
                Some(state) => {
                    let work = Work {
                        item,
                        prev,
                        seq,
                        worker_id,
                        cancel,
                    };
                    transform.transform(work, state)
                }
                None => Outcome::Failed,
            };
            metrics.record_busy(started.elapsed());

            match outcome {
                Outcome::Done(output) => completions.push(seq, output),
                Outcome::Cancelled => {
                    metrics.cancelled.fetch_add(1, Ordering::AcqRel);
                    tracing::trace!(seq = seq, worker_id = worker_id, "Transform cancelled");
                }
                Outcome::Failed => {
                    metrics.failed.fetch_add(1, Ordering::AcqRel);
                    tracing::debug!(seq = seq, worker_id = worker_id, "Transform failed");
                }
            }
            guard.settled = true;
        });
    }
}

/// Counts a transform that unwound without settling its item
struct SettleGuard {
    metrics: Arc<PipelineMetrics>,
    seq: u64,
    settled: bool,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.metrics.failed.fetch_add(1, Ordering::AcqRel);
            tracing::error!(seq = self.seq, "Transform panicked");
        }
    }
}

struct Merger<O, K> {
    sink: K,
    completions: Arc<Completions<O>>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
    finishing: Arc<AtomicBool>,
    merge_wait: Duration,
    /// Last forwarded sequence, `None` before the first
    last: Option<u64>,
}

impl<O: Send + 'static, K: MergeSink<O>> Merger<O, K> {
    fn run(mut self) {
        loop {
            // Read before draining so results pushed before the flag are seen
            let finishing = self.finishing.load(Ordering::Acquire);
            let mut batch = self.completions.wait_drain(self.merge_wait);

            if batch.is_empty() {
                if finishing {
                    break;
                }
                continue;
            }

            batch.sort_unstable_by_key(|(seq, _)| *seq);
            for (seq, output) in batch {
                self.merge(seq, output);
            }
        }

        tracing::debug!(last = ?self.last, "Merger exited");
    }

    fn merge(&mut self, seq: u64, output: O) {
        self.metrics.merged.fetch_add(1, Ordering::AcqRel);

        if self.last.map_or(true, |last| seq > last) {
            self.last = Some(seq);
            self.sink.merge(output, &self.cancel);
            self.metrics.delivered.fetch_add(1, Ordering::AcqRel);
        } else {
            let late = self.metrics.out_of_order.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::warn!(
                seq = seq,
                last = ?self.last,
                out_of_order = late,
                "Discarding late result"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::mpsc;

    use super::*;

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    fn config(workers: usize) -> PipelineConfig {
        PipelineConfig::new("test")
            .max_parallel_items(workers)
            .merge_wait(Duration::from_millis(5))
            .source_poll(Duration::from_millis(5))
    }

    fn collecting() -> (impl MergeSink<u64>, Arc<Mutex<Vec<u64>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink_out = Arc::clone(&delivered);
        let sink = move |seq: u64, _: &CancellationToken| sink_out.lock().push(seq);
        (sink, delivered)
    }

    fn echo(work: Work<u64>, _state: &mut ()) -> Option<u64> {
        Some(work.seq)
    }

    #[test]
    fn test_start_requires_runtime() {
        let pipeline: OrderedPipeline<u64, (), u64> = OrderedPipeline::new(config(1));
        let (_tx, rx) = mpsc::channel::<u64>();
        let (sink, _) = collecting();

        let result = pipeline.start(ChannelSource::new(rx), echo, sink, |_| ());
        assert!(matches!(result, Err(PipelineError::NoRuntime)));
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let pipeline: OrderedPipeline<u64, (), u64> = OrderedPipeline::new(config(0));
        let (_tx, rx) = mpsc::channel::<u64>();
        let (sink, _) = collecting();

        let result = pipeline.start(ChannelSource::new(rx), echo, sink, |_| ());
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_start_twice_rejected() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let pipeline: OrderedPipeline<u64, (), u64> = OrderedPipeline::new(config(2));
        let (_tx, rx) = mpsc::channel::<u64>();
        let (sink, _) = collecting();
        let running = pipeline
            .start(ChannelSource::new(rx), echo, sink, |_| ())
            .unwrap();
        assert!(pipeline.is_running());

        let (_tx2, rx2) = mpsc::channel::<u64>();
        let (sink2, _) = collecting();
        let second = pipeline.start(ChannelSource::new(rx2), echo, sink2, |_| ());
        assert!(matches!(second, Err(PipelineError::AlreadyRunning)));

        running.stop();
        assert!(!pipeline.is_running());

        let (_tx3, rx3) = mpsc::channel::<u64>();
        let (sink3, _) = collecting();
        let again = pipeline
            .start(ChannelSource::new(rx3), echo, sink3, |_| ())
            .unwrap();
        drop(again);
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_delivers_in_order_with_prev_item() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let pipeline: OrderedPipeline<u64, (), (u64, Option<u64>)> =
            OrderedPipeline::new(config(4));
        let (tx, rx) = mpsc::channel();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&delivered);

        let running = pipeline
            .start(
                ChannelSource::new(rx),
                |work: Work<u64>, _: &mut ()| Some((*work.item, work.prev.map(|p| *p))),
                move |pair: (u64, Option<u64>), _: &CancellationToken| out.lock().push(pair),
                |_| (),
            )
            .unwrap();

        for (n, item) in [10, 20, 30].into_iter().enumerate() {
            tx.send(item).unwrap();
            assert!(wait_until(Duration::from_secs(2), || {
                running.stats().merged == n as u64 + 1 && running.busy_workers() == 0
            }));
        }
        let stats = running.stop();

        assert_eq!(
            *delivered.lock(),
            vec![(10, None), (20, Some(10)), (30, Some(20))]
        );
        assert_eq!(stats.delivered, 3);
        assert!(stats.is_balanced());
    }

    #[test]
    fn test_drops_when_workers_busy() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate = Mutex::new(gate_rx);

        let pipeline: OrderedPipeline<u64, (), u64> = OrderedPipeline::new(config(1));
        let (tx, rx) = mpsc::channel();
        let (sink, delivered) = collecting();
        let running = pipeline
            .start(
                ChannelSource::new(rx),
                move |work: Work<u64>, _: &mut ()| {
                    let _ = gate.lock().recv();
                    Some(work.seq)
                },
                sink,
                |_| (),
            )
            .unwrap();

        for item in 0..3u64 {
            tx.send(item).unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || {
            running.stats().dropped == 2
        }));
        assert_eq!(running.stats().in_flight, 1);
        assert_eq!(running.busy_workers(), 1);

        gate_tx.send(()).unwrap();
        let stats = running.stop();

        assert_eq!(*delivered.lock(), vec![1]);
        assert_eq!(stats.received, 3);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.dropped, 2);
        assert!(stats.is_balanced());
    }

    #[test]
    fn test_worker_states_reused() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let created = Arc::new(AtomicU64::new(0));
        let factory_count = Arc::clone(&created);

        let pipeline: OrderedPipeline<u64, u64, u64> = OrderedPipeline::new(config(2));
        let (tx, rx) = mpsc::channel();
        let (sink, delivered) = collecting();
        let running = pipeline
            .start(
                ChannelSource::new(rx),
                |_work: Work<u64>, uses: &mut u64| {
                    *uses += 1;
                    Some(*uses)
                },
                sink,
                move |_| {
                    factory_count.fetch_add(1, Ordering::SeqCst);
                    0u64
                },
            )
            .unwrap();

        for item in 0..6u64 {
            tx.send(item).unwrap();
            assert!(wait_until(Duration::from_secs(2), || {
                running.stats().merged == item + 1 && running.busy_workers() == 0
            }));
        }
        running.stop();

        assert_eq!(created.load(Ordering::SeqCst), 2);
        let total_uses: u64 = delivered.lock().len() as u64;
        assert_eq!(total_uses, 6);
    }

    #[test]
    fn test_panicking_transform_returns_state() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let pipeline: OrderedPipeline<u64, (), u64> = OrderedPipeline::new(config(1));
        let (tx, rx) = mpsc::channel();
        let (sink, delivered) = collecting();
        let running = pipeline
            .start(
                ChannelSource::new(rx),
                |work: Work<u64>, _: &mut ()| {
                    if work.seq == 2 {
                        panic!("encoder defect");
                    }
                    Some(work.seq)
                },
                sink,
                |_| (),
            )
            .unwrap();

        for item in 0..3u64 {
            tx.send(item).unwrap();
            assert!(wait_until(Duration::from_secs(2), || {
                let s = running.stats();
                s.in_flight == 0 && s.dispatched == item + 1 && running.busy_workers() == 0
            }));
        }
        let stats = running.stop();

        assert_eq!(*delivered.lock(), vec![1, 3]);
        assert_eq!(stats.failed, 1);
        assert!(stats.is_balanced());
    }

    #[test]
    fn test_stop_cancels_in_flight_work() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let pipeline: OrderedPipeline<u64, (), u64> = OrderedPipeline::new(config(1));
        let (tx, rx) = mpsc::channel();
        let (sink, delivered) = collecting();
        let running = pipeline
            .start(
                ChannelSource::new(rx),
                |work: Work<u64>, _: &mut ()| {
                    while !work.cancel.is_cancelled() {
                        thread::sleep(Duration::from_millis(1));
                    }
                    None::<u64>
                },
                sink,
                |_| (),
            )
            .unwrap();

        tx.send(1).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            running.stats().dispatched == 1
        }));
        let stats = running.stop();

        assert!(delivered.lock().is_empty());
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.in_flight, 0);
        assert!(stats.is_balanced());
    }

    #[test]
    fn test_subscriptions() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let every = Arc::new(Mutex::new(Vec::new()));
        let when = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline: OrderedPipeline<u64, (), u64> = OrderedPipeline::new(config(2));
        let seen = Arc::clone(&every);
        pipeline.subscribe_every(2, move |_item, seq| seen.lock().push(seq));
        let seen = Arc::clone(&when);
        pipeline.subscribe_when(|seq| seq == 3, move |item, _seq| seen.lock().push(*item));

        let (tx, rx) = mpsc::channel();
        let (sink, _) = collecting();
        let running = pipeline
            .start(ChannelSource::new(rx), echo, sink, |_| ())
            .unwrap();

        for (n, item) in [100, 200, 300, 400, 500].into_iter().enumerate() {
            tx.send(item).unwrap();
            assert!(wait_until(Duration::from_secs(2), || {
                running.stats().merged == n as u64 + 1 && running.busy_workers() == 0
            }));
        }
        assert!(wait_until(Duration::from_secs(2), || {
            every.lock().len() == 2 && when.lock().len() == 1
        }));
        running.stop();

        let mut every = every.lock().clone();
        every.sort_unstable();
        assert_eq!(every, vec![2, 4]);
        assert_eq!(*when.lock(), vec![300]);
    }

    #[test]
    fn test_slow_sink_bounds_in_flight() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let pipeline: OrderedPipeline<u64, (), u64> = OrderedPipeline::new(config(1));
        let metrics = Arc::clone(pipeline.metrics());
        let max_in_flight = Arc::new(AtomicU64::new(0));
        let observed = Arc::clone(&max_in_flight);

        let mut next = 0u64;
        let source = move |_cancel: &CancellationToken| {
            observed.fetch_max(metrics.in_flight(), Ordering::SeqCst);
            if next < 30 {
                next += 1;
                thread::sleep(Duration::from_millis(5));
                Some(next)
            } else {
                thread::sleep(Duration::from_millis(1));
                None
            }
        };

        let running = pipeline
            .start(
                source,
                echo,
                |_: u64, _: &CancellationToken| thread::sleep(Duration::from_millis(50)),
                |_| (),
            )
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            let s = running.stats();
            s.received == 30 && s.in_flight == 0
        }));
        let stats = running.stop();

        assert!(max_in_flight.load(Ordering::SeqCst) <= 1);
        assert!(stats.dropped > 0);
        assert_eq!(stats.received, 30);
        assert!(stats.is_balanced());
    }

    #[test]
    fn test_failed_outcome_counted() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let pipeline: OrderedPipeline<u64, (), u64> = OrderedPipeline::new(config(1));
        let (tx, rx) = mpsc::channel();
        let (sink, delivered) = collecting();
        let running = pipeline
            .start(
                ChannelSource::new(rx),
                |work: Work<u64>, _: &mut ()| {
                    if *work.item == 0 {
                        Outcome::Failed
                    } else {
                        Outcome::Done(work.seq)
                    }
                },
                sink,
                |_| (),
            )
            .unwrap();

        for (n, item) in [0u64, 7].into_iter().enumerate() {
            tx.send(item).unwrap();
            assert!(wait_until(Duration::from_secs(2), || {
                let s = running.stats();
                s.dispatched == n as u64 + 1 && s.in_flight == 0 && running.busy_workers() == 0
            }));
        }
        let stats = running.stop();

        assert_eq!(*delivered.lock(), vec![2]);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 0);
        assert!(stats.is_balanced());
    }
}

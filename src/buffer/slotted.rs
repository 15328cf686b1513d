//! Single-writer, multi-reader slotted cyclic buffer
//!
//! Each slot pairs a value with a readiness signal. The writer keeps one
//! *dark* slot ahead of its write position: before publishing into slot
//! `n`, it clears the signal of slot `n + 1`. A reader caught up with the
//! writer therefore always parks on a dark slot and is woken by the next
//! publish, never by a stale signal from the previous lap.
//!
//! ```text
//!        cursor
//!          v
//!   [ 5 ][ 6 ][ ░ ][ 2 ][ 3 ][ 4 ]      ░ = dark (signal cleared)
//!               ^ next publish lands here
//! ```
//!
//! Readers are independent: each keeps its own position and dropped count.
//! A reader whose backlog reaches `capacity - 1` jumps to the newest item.
//! Its dropped count grows by the items the writer overwrote before the
//! reader got to them, i.e. the backlog beyond the `capacity - 1` readable
//! slots. With one dark slot, a reader that first reads after
//! `capacity + 5` appends reports 6 dropped.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Slot<T> {
    value: RwLock<Option<T>>,
    ready: AtomicBool,
    notify: Notify,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            value: RwLock::new(None),
            ready: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }
}

/// Fixed ring of signal-carrying slots
pub struct SlottedCyclicBuffer<T> {
    slots: Box<[Slot<T>]>,
    /// Index of the most recently published slot, -1 before the first append
    cursor: AtomicI32,
    /// Items ever published
    written: AtomicI64,
    /// Serialises writers; appends from several threads stay well formed
    writer: Mutex<()>,
}

impl<T: Clone + Send + Sync> SlottedCyclicBuffer<T> {
    /// Create a buffer with `capacity` slots
    ///
    /// # Panics
    ///
    /// Panics if capacity is less than 2 (one slot is always dark).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "capacity must be >= 2");
        assert!(capacity <= i32::MAX as usize, "capacity must fit in i32");

        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            cursor: AtomicI32::new(-1),
            written: AtomicI64::new(0),
            writer: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index of the most recently published slot (-1 when empty)
    pub fn cursor(&self) -> i32 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Items ever published
    pub fn written(&self) -> i64 {
        self.written.load(Ordering::Acquire)
    }

    /// Publish an item
    pub fn append(&self, item: T) {
        let _guard = self.writer.lock();
        let capacity = self.slots.len();

        let next = ((self.cursor.load(Ordering::Relaxed) + 1) as usize) % capacity;
        let following = (next + 1) % capacity;

        // Keep the slot after the write position dark
        self.slots[following].ready.store(false, Ordering::Release);

        let slot = &self.slots[next];
        *slot.value.write() = Some(item);
        self.cursor.store(next as i32, Ordering::Release);
        self.written.fetch_add(1, Ordering::AcqRel);
        slot.ready.store(true, Ordering::Release);
        slot.notify.notify_waiters();
    }

    /// Start an independent reader at the beginning of the stream
    ///
    /// The reader yields until `cancel` fires.
    pub fn read(self: &Arc<Self>, cancel: CancellationToken) -> SlotReader<T> {
        SlotReader {
            buffer: Arc::clone(self),
            consumed: 0,
            dropped: 0,
            cancel,
        }
    }
}

impl<T> std::fmt::Debug for SlottedCyclicBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlottedCyclicBuffer")
            .field("capacity", &self.slots.len())
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .field("written", &self.written.load(Ordering::Relaxed))
            .finish()
    }
}

/// One item handed to a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotItem<T> {
    pub item: T,
    /// Items published but not yet read by this reader
    pub pending: u64,
    /// Items overwritten before this reader reached them, so far
    pub dropped: u64,
}

/// Independent cursor over a [`SlottedCyclicBuffer`]
pub struct SlotReader<T> {
    buffer: Arc<SlottedCyclicBuffer<T>>,
    /// Sequence number of the next item to read
    consumed: i64,
    dropped: u64,
    cancel: CancellationToken,
}

impl<T: Clone + Send + Sync> SlotReader<T> {
    /// Items overwritten before this reader reached them
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Wait for the next item; `None` once cancelled
    pub async fn next(&mut self) -> Option<SlotItem<T>> {
        let capacity = self.buffer.slots.len() as i64;

        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            let written = self.buffer.written.load(Ordering::Acquire);
            let backlog = written - self.consumed;
            if backlog >= capacity - 1 {
                let lost = backlog - (capacity - 1);
                self.dropped += lost as u64;
                self.consumed = written - 1;
                tracing::trace!(lost, dropped = self.dropped, "Slot reader lagged, jumping to newest");
            }

            let slot = &self.buffer.slots[(self.consumed % capacity) as usize];
            if !self.wait_ready(slot).await {
                return None;
            }

            let value = slot.value.read().clone();
            let written_now = self.buffer.written.load(Ordering::Acquire);
            if written_now - self.consumed >= capacity - 1 {
                // The writer may have reused this slot while we read it
                continue;
            }

            let Some(item) = value else {
                continue;
            };

            self.consumed += 1;
            return Some(SlotItem {
                item,
                pending: (written_now - self.consumed).max(0) as u64,
                dropped: self.dropped,
            });
        }
    }

    async fn wait_ready(&self, slot: &Slot<T>) -> bool {
        loop {
            let notified = slot.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if slot.ready.load(Ordering::Acquire) {
                return true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}

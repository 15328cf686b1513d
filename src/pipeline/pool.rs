//! Worker state pool
//!
//! The pool owns one state per worker slot, created once at start. A slot
//! leaves the pool as a [`WorkerLease`] and goes back when the lease is
//! dropped, whether the worker finished, was cancelled or panicked.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct WorkerSlot<S> {
    id: usize,
    state: S,
}

/// Fixed set of reusable worker states
pub struct WorkerPool<S> {
    free: Mutex<VecDeque<WorkerSlot<S>>>,
    returned: Condvar,
    size: usize,
}

impl<S: Send> WorkerPool<S> {
    /// Build `size` states with `factory(worker_index)`
    pub fn new(size: usize, mut factory: impl FnMut(usize) -> S) -> Self {
        let free = (0..size)
            .map(|id| WorkerSlot {
                id,
                state: factory(id),
            })
            .collect();

        Self {
            free: Mutex::new(free),
            returned: Condvar::new(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently in the pool
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Slots currently leased
    pub fn leased(&self) -> usize {
        self.size - self.available()
    }

    /// Take a free slot, or `None` when every slot is leased
    pub fn try_lease(self: &Arc<Self>) -> Option<WorkerLease<S>> {
        let slot = self.free.lock().pop_front()?;
        Some(WorkerLease {
            slot: Some(slot),
            pool: Arc::clone(self),
        })
    }

    /// Block until every slot is back or `timeout` passes
    ///
    /// Returns true when the pool is full.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut free = self.free.lock();
        while free.len() < self.size {
            if self.returned.wait_until(&mut free, deadline).timed_out() {
                return free.len() == self.size;
            }
        }
        true
    }

    fn give_back(&self, slot: WorkerSlot<S>) {
        self.free.lock().push_back(slot);
        self.returned.notify_all();
    }
}

impl<S> std::fmt::Debug for WorkerPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("available", &self.free.lock().len())
            .finish()
    }
}

/// Exclusive use of one worker slot
pub struct WorkerLease<S: Send> {
    slot: Option<WorkerSlot<S>>,
    pool: Arc<WorkerPool<S>>,
}

impl<S: Send> WorkerLease<S> {
    /// Worker index, stable for the pool's lifetime
    pub fn id(&self) -> usize {
        self.slot.as_ref().map(|s| s.id).unwrap_or_default()
    }

    pub fn state_mut(&mut self) -> Option<&mut S> {
        self.slot.as_mut().map(|s| &mut s.state)
    }
}

impl<S: Send> Drop for WorkerLease<S> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.give_back(slot);
        }
    }
}

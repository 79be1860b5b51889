//! A lightweight, user-space read-copy-update (RCU) quiescence primitive.
//!
//! There is a single process-wide grace-period counter `G`. Each reader thread
//! registers a [`ReaderHandle`] carrying a local period word and a recursion
//! depth counter that must stay at most 1 — re-entry on the same handle is a
//! fatal programming error, not a recoverable one (see [`ReaderHandle::region`]).
//!
//! `read_begin`/`read_end` (here, entering/leaving a [`ReaderGuard`] scope) are
//! lock-free and wait-free: a relaxed store, a full fence, and on exit a
//! conditional semaphore post. [`QuiescentState::synchronize`] is the only
//! operation that blocks, and only storage-reclaiming writers (container
//! resize, label-map reset) call it.
#[cfg(loom)]
use loom::{
    sync::{atomic, Arc, Condvar, Mutex},
};
#[cfg(not(loom))]
use std::sync::{atomic, Arc, Condvar, Mutex};

use std::cell::Cell;

use crate::error::CoreError;

/// Binary-ish counting semaphore used to wake a writer blocked in `synchronize`.
///
/// A plain `Mutex<u32>` + `Condvar` pair, in the spirit of the process-wide
/// semaphore described by the spec — there is no `std`/`loom` semaphore type,
/// so this is the smallest thing that behaves like one.
struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut n = self.count.lock().unwrap();
        *n += 1;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut n = self.count.lock().unwrap();
        while *n == 0 {
            n = self.cv.wait(n).unwrap();
        }
        *n -= 1;
    }
}

/// Per-thread reader state, shared between the registry, the [`ReaderHandle`],
/// and any in-flight `synchronize()` snapshot.
struct HandleState {
    /// The grace period this reader last observed entering a region, or `0`
    /// while the reader is outside any region.
    period: atomic::AtomicU64,
    /// Set by a writer that wants to be woken when this reader goes quiescent.
    wake: atomic::AtomicBool,
}

struct Shared {
    grace_period: atomic::AtomicU64,
    registry: Mutex<slab::Slab<Arc<HandleState>>>,
    sem: Semaphore,
}

/// Process-wide RCU domain: one per graph (or shared across several, if the
/// embedder chooses — nothing here is tied to a particular container).
pub struct QuiescentState {
    shared: Arc<Shared>,
}

impl Default for QuiescentState {
    fn default() -> Self {
        Self::new()
    }
}

impl QuiescentState {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                // Start at 1 so a freshly registered handle's period (0, meaning
                // "not in a region") is never confused with a live grace period.
                grace_period: atomic::AtomicU64::new(1),
                registry: Mutex::new(slab::Slab::new()),
                sem: Semaphore::new(),
            }),
        }
    }

    /// Register a new reader thread, returning its handle.
    pub fn register(&self) -> ReaderHandle {
        let state = Arc::new(HandleState {
            period: atomic::AtomicU64::new(0),
            wake: atomic::AtomicBool::new(false),
        });
        let index = self.shared.registry.lock().unwrap().insert(state.clone());
        ReaderHandle {
            shared: self.shared.clone(),
            state,
            index,
            depth: Cell::new(0),
        }
    }

    /// Advance the grace period and block until every reader that was mid-region
    /// when this call began has left that region.
    ///
    /// Only storage-reclaiming writers call this (container resize, label-map
    /// reset); it may block arbitrarily long if a reader never quiesces.
    pub fn synchronize(&self) {
        let g_prev = self
            .shared
            .grace_period
            .fetch_add(1, atomic::Ordering::AcqRel);

        let mut pending: Vec<Arc<HandleState>> = {
            let registry = self.shared.registry.lock().unwrap();
            registry.iter().map(|(_, h)| h.clone()).collect()
        };
        for h in &pending {
            h.wake.store(true, atomic::Ordering::Relaxed);
        }
        atomic::fence(atomic::Ordering::SeqCst);

        loop {
            pending.retain(|h| {
                let p = h.period.load(atomic::Ordering::Acquire);
                p != 0 && p == g_prev
            });
            if pending.is_empty() {
                return;
            }
            self.shared.sem.wait();
        }
    }
}

/// A registered reader thread's handle into a [`QuiescentState`].
///
/// Not `Sync`: a handle is meant to be owned by exactly one thread at a time
/// (its recursion-depth counter is a plain [`Cell`]), though it can be moved
/// to another thread between uses.
pub struct ReaderHandle {
    shared: Arc<Shared>,
    state: Arc<HandleState>,
    index: usize,
    depth: Cell<u32>,
}

impl ReaderHandle {
    fn enter(&self) {
        let g = self.shared.grace_period.load(atomic::Ordering::Relaxed);
        self.state.period.store(g, atomic::Ordering::Relaxed);
        atomic::fence(atomic::Ordering::SeqCst);
        self.depth.set(self.depth.get() + 1);
    }

    fn exit(&self) {
        let d = self.depth.get();
        debug_assert!(d > 0, "reader region exit without a matching entry");
        self.depth.set(d - 1);
        self.state.period.store(0, atomic::Ordering::Release);
        atomic::fence(atomic::Ordering::SeqCst);
        if self.state.wake.swap(false, atomic::Ordering::AcqRel) {
            self.shared.sem.post();
        }
    }

    /// Enter a reader region, or fail if this handle is already inside one.
    ///
    /// Reentrant use of the same handle is a programming error; [`Self::region`]
    /// panics on it, this gives a caller that wants to check first (e.g. a
    /// wrapper embedding this crate behind its own API) a non-panicking path.
    pub fn try_region(&self) -> Result<ReaderGuard<'_>, CoreError> {
        if self.depth.get() != 0 {
            return Err(CoreError::ReentrantReaderRegion);
        }
        self.enter();
        Ok(ReaderGuard { handle: self })
    }

    /// Enter a reader region. Every operation that touches graph or container
    /// storage must run inside one of these.
    ///
    /// # Panics
    ///
    /// Panics if this handle is already inside a region (recursive entry is a
    /// fatal programming error per the quiescence primitive's contract).
    pub fn region(&self) -> ReaderGuard<'_> {
        self.try_region()
            .expect("rcu: recursive reader region entry on the same handle")
    }

    /// Temporarily leave the current region so a writer can call
    /// `synchronize()` without deadlocking on its own reader state, then
    /// re-enter with [`Self::resume_region`]. Used internally by the
    /// growable array's resize path and by label-map reset.
    pub(crate) fn pause_region(&self) {
        self.exit();
    }

    /// Counterpart to [`Self::pause_region`].
    pub(crate) fn resume_region(&self) {
        self.enter();
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.shared.registry.lock().unwrap().remove(self.index);
    }
}

/// A scope during which it is safe to dereference container contents without
/// risk of concurrent reclamation. Dropping this ends the region.
pub struct ReaderGuard<'a> {
    handle: &'a ReaderHandle,
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.handle.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(not(loom))]
    use std::thread;

    #[test]
    fn register_and_region_roundtrip() {
        let qp = QuiescentState::new();
        let h = qp.register();
        {
            let _r = h.region();
        }
        // A second, non-overlapping region is fine.
        let _r = h.region();
    }

    #[test]
    #[should_panic(expected = "recursive")]
    fn reentrant_region_panics() {
        let qp = QuiescentState::new();
        let h = qp.register();
        let _outer = h.region();
        let _inner = h.region();
    }

    #[test]
    fn try_region_reports_reentrancy_without_panicking() {
        let qp = QuiescentState::new();
        let h = qp.register();
        let _outer = h.region();
        assert!(matches!(
            h.try_region(),
            Err(CoreError::ReentrantReaderRegion)
        ));
    }

    #[test]
    fn synchronize_returns_immediately_with_no_readers() {
        let qp = QuiescentState::new();
        qp.synchronize();
    }

    #[test]
    fn synchronize_waits_for_an_in_progress_reader() {
        let qp = Arc::new(QuiescentState::new());
        let h = qp.register();

        let region = h.region();
        let qp2 = qp.clone();
        let t = thread::spawn(move || {
            qp2.synchronize();
        });

        // Give the writer a moment to start waiting, then let the reader finish.
        thread::yield_now();
        drop(region);
        t.join().unwrap();
    }

    #[test]
    fn unregistered_handle_does_not_block_synchronize() {
        let qp = QuiescentState::new();
        {
            let h = qp.register();
            let _r = h.region();
            // handle dropped (and thus unregistered) while "inside" a region
        }
        qp.synchronize();
    }
}

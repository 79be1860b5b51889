//! Published-pointer cell: a thin wrapper around an atomic pointer used to
//! swap a container's backing storage (or the owning pointer to a whole
//! sub-structure, as `CallGraph` does for its label map) without readers ever
//! observing a torn or freed value.
//!
//! There is no ownership tracking here — this type does not drop what it
//! points to. It only sequences the pointer swap itself; freeing the old
//! value is the caller's job, done only after a grace period has elapsed
//! (see [`crate::qp::QuiescentState::synchronize`]).
use std::marker::PhantomData;
#[cfg(loom)]
use loom::sync::atomic::{AtomicPtr, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicPtr, Ordering};

pub struct PublishedPtr<T> {
    inner: AtomicPtr<T>,
    _marker: PhantomData<T>,
}

impl<T> PublishedPtr<T> {
    pub fn new(ptr: *mut T) -> Self {
        Self {
            inner: AtomicPtr::new(ptr),
            _marker: PhantomData,
        }
    }

    /// Reader-side load. Acquire pairs with the Release in [`Self::store`] so
    /// that everything the writer did to build the new value happens-before
    /// this thread observes it.
    pub fn load(&self) -> *mut T {
        self.inner.load(Ordering::Acquire)
    }

    /// Load intended only for the single writer that currently holds the
    /// exclusive right to mutate this cell (e.g. a resize holding the
    /// container's grow lock). Relaxed, because that exclusivity is what
    /// orders this access, not the atomic itself.
    ///
    /// # Safety
    ///
    /// The caller must actually hold that exclusive right; calling this from
    /// two threads concurrently without external mutual exclusion races.
    pub unsafe fn load_owner(&self) -> *mut T {
        self.inner.load(Ordering::Relaxed)
    }

    /// Publish a new pointer. Release orders every write used to build `*ptr`
    /// before any subsequent [`Self::load`].
    pub fn store(&self, ptr: *mut T) {
        self.inner.store(ptr, Ordering::Release);
    }
}

// A `PublishedPtr<T>` only ever moves a `*mut T` between threads, so `Send`
// only needs `T: Send`. But `load()` hands out a pointer that many reader
// threads may dereference *concurrently* (that's the whole point), so `Sync`
// needs `T: Sync` too — matching the bound the teacher crate's `Reader<T>`/
// `Writer<T>` put on the same situation.
unsafe impl<T: Send> Send for PublishedPtr<T> {}
unsafe impl<T: Send + Sync> Sync for PublishedPtr<T> {}

//! Concurrent growable array: an append-only, lock-free-for-readers container
//! over a power-of-two-capacity backing buffer, grown by a single writer at a
//! time under [`Cga::grow_mutex`] while readers keep going through the old
//! buffer until it is safe to free.
//!
//! Every slot is always initialised — `E: Default` fills the whole backing
//! buffer up front, so there is no `MaybeUninit` bookkeeping and the ordinary
//! `Drop` of the backing `Box<[E]>` is correct on its own. A freshly
//! `reserve`d index holds `E::default()` until the reserving thread replaces
//! it; nothing else can observe that index until the reserver publishes it
//! through a higher container (`CHS`/`CSM`/`by_name`, …), so the placeholder
//! is never mistaken for real data.
//!
//! Growing a container is a policy point, not a blind memcpy: the caller
//! supplies a `migrate` closure that moves live entries from the old slice
//! into the new one however its own semantics require (plain move for an
//! append-only array of owned records, rehash-by-probing for an open-
//! addressed table built on top of this array).
#[cfg(loom)]
use loom::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};
#[cfg(not(loom))]
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use crate::ppc::PublishedPtr;
use crate::qp::{QuiescentState, ReaderHandle};

pub struct Cga<E> {
    backing: PublishedPtr<E>,
    cap: AtomicUsize,
    count: AtomicUsize,
    grow_mutex: Mutex<()>,
    /// Fraction of capacity at which `reserve` triggers a doubling grow.
    /// 1.0 for a raw append-only array, 0.75 for the hash tables built on it.
    load_factor: f64,
}

impl<E: Default> Cga<E> {
    pub fn with_capacity(initial_cap: usize) -> Self {
        Self::with_capacity_and_load_factor(initial_cap, 1.0)
    }

    pub fn with_capacity_and_load_factor(initial_cap: usize, load_factor: f64) -> Self {
        let cap = initial_cap.max(1).next_power_of_two();
        let ptr = Self::alloc_buf(cap);
        Self {
            backing: PublishedPtr::new(ptr),
            cap: AtomicUsize::new(cap),
            count: AtomicUsize::new(0),
            grow_mutex: Mutex::new(()),
            load_factor,
        }
    }

    fn alloc_buf(cap: usize) -> *mut E {
        let boxed: Box<[E]> = (0..cap).map(|_| E::default()).collect();
        Box::into_raw(boxed) as *mut E
    }

    /// # Safety
    /// `ptr` must be a pointer previously returned by [`Self::alloc_buf`] with
    /// the same `cap`, and must not be accessed again afterwards.
    unsafe fn free_buf(ptr: *mut E, cap: usize) {
        drop(Box::from_raw(std::slice::from_raw_parts_mut(ptr, cap)));
    }
}

impl<E: Default> Cga<E> {
    /// Reserve the next index, growing the backing buffer first if the
    /// configured load factor has been reached. `migrate` is only invoked if
    /// a grow actually happens.
    pub fn reserve(
        &self,
        qp: &QuiescentState,
        handle: &ReaderHandle,
        migrate: &mut dyn FnMut(&mut [E], &mut [E]),
    ) -> usize {
        loop {
            let current = self.count.load(Ordering::Relaxed);
            let cap_snap = self.cap.load(Ordering::Acquire);
            if (current as f64) >= self.load_factor * (cap_snap as f64) {
                self.grow(qp, handle, cap_snap, cap_snap * 2, migrate);
                continue;
            }
            if self
                .count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }

    /// Give back a reservation the caller decided not to use (e.g. it found
    /// the key it was about to insert was already present).
    pub fn drop_reservation(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Double the backing buffer's capacity. Returns `false` without doing
    /// anything if another thread already grew past `expected_cap` first.
    fn grow(
        &self,
        qp: &QuiescentState,
        handle: &ReaderHandle,
        expected_cap: usize,
        new_cap: usize,
        migrate: &mut dyn FnMut(&mut [E], &mut [E]),
    ) -> bool {
        let _guard = self.grow_mutex.lock().unwrap();
        if self.cap.load(Ordering::Relaxed) != expected_cap {
            return false;
        }

        let new_ptr = Self::alloc_buf(new_cap);
        // SAFETY: holding `grow_mutex` makes us the sole writer of `backing`
        // right now; no other thread can be resizing concurrently.
        let old_ptr = unsafe { self.backing.load_owner() };
        let old_slice = unsafe { std::slice::from_raw_parts_mut(old_ptr, expected_cap) };
        let new_slice = unsafe { std::slice::from_raw_parts_mut(new_ptr, new_cap) };
        migrate(old_slice, new_slice);

        self.backing.store(new_ptr);
        self.cap.store(new_cap, Ordering::Release);

        // Readers mid-iteration over the old buffer may still be holding a
        // pointer into it; wait for them to quiesce before freeing it. We
        // must leave our own region first or `synchronize` would wait on us.
        handle.pause_region();
        qp.synchronize();
        handle.resume_region();

        // SAFETY: `synchronize` guarantees no reader that could have been
        // dereferencing `old_ptr` is still doing so.
        unsafe { Self::free_buf(old_ptr, expected_cap) };
        true
    }

    pub fn get(&self, index: usize) -> &E {
        assert!(
            index < self.capacity(),
            "cga: index {index} out of range (capacity {})",
            self.capacity()
        );
        let ptr = self.backing.load();
        // SAFETY: `index` is within the current capacity and the backing
        // buffer is always fully initialised (`E: Default`).
        unsafe { &*ptr.add(index) }
    }

    /// Replace the value at `index`, returning the previous one.
    ///
    /// # Safety
    /// The caller must hold exclusive write rights to `index` — typically
    /// because it just reserved it and no other thread can yet discover it
    /// through any published lookup.
    pub unsafe fn replace(&self, index: usize, value: E) -> E {
        let ptr = self.backing.load();
        std::mem::replace(&mut *ptr.add(index), value)
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap.load(Ordering::Acquire)
    }

    /// Iterate every slot up to the current count, including slots that are
    /// reserved but not yet published by whatever container sits on top of
    /// this array — callers that need per-slot readiness encode it
    /// themselves (an empty-key sentinel, a `PENDING` tri-state, …).
    pub fn iter(&self) -> Iter<'_, E> {
        let ptr = self.backing.load();
        Iter {
            ptr,
            end: self.len(),
            idx: 0,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<E> Drop for Cga<E> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no other reference to this container
        // exists, so no reader can be mid-dereference into `backing`.
        let ptr = unsafe { self.backing.load_owner() };
        let cap = *self.cap.get_mut();
        unsafe { Self::free_buf(ptr, cap) };
    }
}

pub struct Iter<'a, E> {
    ptr: *mut E,
    end: usize,
    idx: usize,
    _marker: std::marker::PhantomData<&'a E>,
}

impl<'a, E> Iterator for Iter<'a, E> {
    type Item = &'a E;

    fn next(&mut self) -> Option<&'a E> {
        if self.idx >= self.end {
            return None;
        }
        let i = self.idx;
        self.idx += 1;
        // SAFETY: `i < self.end <= count <= capacity` at the time `ptr` was
        // loaded, and the buffer that `ptr` points to is kept alive for at
        // least this iterator's lifetime by the reader region it is used
        // under.
        Some(unsafe { &*self.ptr.add(i) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blind_move<E: Default>(old: &mut [E], new: &mut [E]) {
        for (i, slot) in old.iter_mut().enumerate() {
            new[i] = std::mem::take(slot);
        }
    }

    #[test]
    fn reserve_assigns_increasing_indices() {
        let qp = QuiescentState::new();
        let h = qp.register();
        let array: Cga<u64> = Cga::with_capacity(2);
        let mut migrate = blind_move::<u64>;
        for expected in 0..10u64 {
            let idx = array.reserve(&qp, &h, &mut migrate);
            assert_eq!(idx as u64, expected);
            unsafe { array.replace(idx, expected) };
        }
        assert_eq!(array.len(), 10);
        for i in 0..10 {
            assert_eq!(*array.get(i), i as u64);
        }
    }

    #[test]
    fn grow_preserves_existing_values() {
        let qp = QuiescentState::new();
        let h = qp.register();
        let array: Cga<u64> = Cga::with_capacity(1);
        let mut migrate = blind_move::<u64>;
        for i in 0..64u64 {
            let idx = array.reserve(&qp, &h, &mut migrate);
            unsafe { array.replace(idx, i) };
        }
        assert!(array.capacity() >= 64);
        for i in 0..64 {
            assert_eq!(*array.get(i), i as u64);
        }
    }

    #[test]
    fn drop_reservation_allows_reuse_of_the_slot_count() {
        let qp = QuiescentState::new();
        let h = qp.register();
        let array: Cga<u64> = Cga::with_capacity(4);
        let mut migrate = blind_move::<u64>;
        let idx = array.reserve(&qp, &h, &mut migrate);
        array.drop_reservation();
        assert_eq!(array.len(), 0);
        let idx2 = array.reserve(&qp, &h, &mut migrate);
        assert_eq!(idx, idx2);
    }

    #[test]
    fn concurrent_inserts_under_contention_all_land() {
        use std::sync::Arc;
        use std::thread;

        let qp = Arc::new(QuiescentState::new());
        let array: Arc<Cga<u64>> = Arc::new(Cga::with_capacity(2));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let qp = qp.clone();
                let array = array.clone();
                thread::spawn(move || {
                    let h = qp.register();
                    let mut migrate = blind_move::<u64>;
                    for i in 0..100u64 {
                        let idx = array.reserve(&qp, &h, &mut migrate);
                        unsafe { array.replace(idx, t * 100 + i) };
                    }
                })
            })
            .collect();
        for jh in handles {
            jh.join().unwrap();
        }

        assert_eq!(array.len(), 800);
        let mut seen: Vec<u64> = array.iter().copied().collect();
        seen.sort_unstable();
        let mut expected: Vec<u64> = (0..8).flat_map(|t| (0..100).map(move |i| t * 100 + i)).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}

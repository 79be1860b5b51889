//! Concurrent hash set of machine words (node indices), open-addressed with
//! linear probing over a [`Cga`] backing array. `usize::MAX` is reserved as
//! the empty-slot sentinel, so real keys must never use it (node indices
//! never will in practice, but [`ConcurrentWordSet::insert`] asserts it).
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cga::Cga;
use crate::qp::{QuiescentState, ReaderHandle};

pub const EMPTY: usize = usize::MAX;

/// A single hash-table slot. Wrapping `AtomicUsize` rather than using it
/// directly lets the empty sentinel be the slot's `Default`, so the backing
/// [`Cga`] can eagerly fill new capacity with "empty" instead of zero.
struct WordSlot(AtomicUsize);

impl Default for WordSlot {
    fn default() -> Self {
        WordSlot(AtomicUsize::new(EMPTY))
    }
}

impl WordSlot {
    fn load(&self, order: Ordering) -> usize {
        self.0.load(order)
    }

    fn compare_exchange(
        &self,
        current: usize,
        new: usize,
        success: Ordering,
        failure: Ordering,
    ) -> Result<usize, usize> {
        self.0.compare_exchange(current, new, success, failure)
    }
}

pub struct ConcurrentWordSet {
    array: Cga<WordSlot>,
}

impl Default for ConcurrentWordSet {
    /// Starts with a small backing capacity, suitable as the value type of a
    /// [`crate::csm::ConcurrentStringMap`] (one per-file or per-label set,
    /// created on first insertion).
    fn default() -> Self {
        Self::with_capacity(2)
    }
}

impl ConcurrentWordSet {
    pub fn with_capacity(initial_cap: usize) -> Self {
        Self {
            array: Cga::with_capacity_and_load_factor(initial_cap, 0.75),
        }
    }

    fn rehash_migrate() -> impl FnMut(&mut [WordSlot], &mut [WordSlot]) {
        |old, new| {
            let new_cap = new.len();
            for slot in old.iter() {
                let key = slot.load(Ordering::Relaxed);
                if key == EMPTY {
                    continue;
                }
                let mut idx = hash_usize(key) & (new_cap - 1);
                loop {
                    if new[idx].load(Ordering::Relaxed) == EMPTY {
                        new[idx].0.store(key, Ordering::Relaxed);
                        break;
                    }
                    idx = (idx + 1) & (new_cap - 1);
                }
            }
        }
    }

    /// Insert `key`, returning `true` if it was newly added and `false` if it
    /// was already present.
    pub fn insert(&self, qp: &QuiescentState, handle: &ReaderHandle, key: usize) -> bool {
        assert_ne!(key, EMPTY, "usize::MAX is reserved as the empty-slot sentinel");
        let mut migrate = Self::rehash_migrate();
        self.array.reserve(qp, handle, &mut migrate);

        let cap = self.array.capacity();
        let mut idx = hash_usize(key) & (cap - 1);
        loop {
            let slot = self.array.get(idx);
            let cur = slot.load(Ordering::Relaxed);
            if cur == key {
                self.array.drop_reservation();
                return false;
            }
            if cur == EMPTY {
                match slot.compare_exchange(EMPTY, key, Ordering::Release, Ordering::Relaxed) {
                    Ok(_) => return true,
                    // Someone else claimed this slot first; re-examine it —
                    // it may now hold our own key or still be contested.
                    Err(_) => continue,
                }
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    pub fn contains(&self, key: usize) -> bool {
        let cap = self.array.capacity();
        let mut idx = hash_usize(key) & (cap - 1);
        loop {
            let cur = self.array.get(idx).load(Ordering::Relaxed);
            if cur == key {
                return true;
            }
            if cur == EMPTY {
                return false;
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    /// Full-capacity scan, not a count-bounded one: entries land wherever
    /// `hash(key)` probes them to, not packed into `[0, len())` the way
    /// `Cga::iter` assumes a plain append-only array is. Must cover every
    /// slot up to `capacity()`, the same range `rehash_migrate` scans.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            array: &self.array,
            idx: 0,
            end: self.array.capacity(),
        }
    }
}

fn hash_usize(v: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    v.hash(&mut h);
    h.finish() as usize
}

pub struct Iter<'a> {
    array: &'a Cga<WordSlot>,
    idx: usize,
    end: usize,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.idx < self.end {
            let i = self.idx;
            self.idx += 1;
            let v = self.array.get(i).load(Ordering::Relaxed);
            if v != EMPTY {
                return Some(v);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let qp = QuiescentState::new();
        let h = qp.register();
        let set = ConcurrentWordSet::with_capacity(4);
        assert!(set.insert(&qp, &h, 42));
        assert!(!set.insert(&qp, &h, 42));
        assert_eq!(set.len(), 1);
        assert!(set.contains(42));
        assert!(!set.contains(7));
    }

    #[test]
    fn grows_and_keeps_all_members() {
        let qp = QuiescentState::new();
        let h = qp.register();
        let set = ConcurrentWordSet::with_capacity(2);
        for i in 0..50 {
            assert!(set.insert(&qp, &h, i));
        }
        assert_eq!(set.len(), 50);
        for i in 0..50 {
            assert!(set.contains(i));
        }
        let mut seen: Vec<usize> = set.iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_inserts_under_four_threads_uphold_uniqueness() {
        use std::sync::Arc;
        use std::thread;

        let qp = Arc::new(QuiescentState::new());
        let set = Arc::new(ConcurrentWordSet::with_capacity(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let qp = qp.clone();
                let set = set.clone();
                thread::spawn(move || {
                    let h = qp.register();
                    for i in 0..100 {
                        set.insert(&qp, &h, i);
                    }
                })
            })
            .collect();
        for jh in handles {
            jh.join().unwrap();
        }

        assert_eq!(set.len(), 100);
        for i in 0..100 {
            assert!(set.contains(i));
        }
    }
}

//! Concurrent string-keyed map, open-addressed with linear probing over a
//! [`Cga`] backing array, single-insertion-wins on key collision.
//!
//! Each slot's key cell moves through three states: `NULL` (empty), `PENDING`
//! (claimed by an inserter, value not yet published) and a pointer to an
//! owned, heap-allocated `String` (resolved, terminal — a slot's key is never
//! cleared once resolved). [`ConcurrentStringMap::acquire`] is the single
//! primitive both [`ConcurrentStringMap::add`] and the call-graph store's
//! name/username/file/label indices are built on: it returns either the
//! existing entry or exclusive permission to fill a freshly claimed slot.
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::cga::Cga;
use crate::qp::{QuiescentState, ReaderHandle};

/// Any non-null pointer works as the claimed-but-unfilled sentinel, as long
/// as it can never coincide with a real `Box<String>` allocation. A dangling
/// well-aligned pointer (never handed out by any allocator) fits, the same
/// way `usize::MAX` serves as the empty-slot sentinel in [`crate::chs`].
fn pending() -> *mut String {
    ptr::NonNull::<String>::dangling().as_ptr()
}

struct StringSlot<V> {
    key: AtomicPtr<String>,
    value: UnsafeCell<V>,
}

impl<V: Default> Default for StringSlot<V> {
    fn default() -> Self {
        StringSlot {
            key: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(V::default()),
        }
    }
}

impl<V> Drop for StringSlot<V> {
    fn drop(&mut self) {
        let k = *self.key.get_mut();
        if !k.is_null() && k != pending() {
            // SAFETY: any non-null, non-`pending` key cell owns a `String`
            // allocated by `VacantSlot::fill` and not yet freed.
            drop(unsafe { Box::from_raw(k) });
        }
    }
}

// The key/value pair is only ever mutated through the `NULL -> PENDING ->
// resolved` protocol below, never through a `&mut` alias while shared. But
// `acquire`/`get_ref` hand out `&V` to whichever threads reach a resolved
// slot concurrently, so `Sync` needs `V: Sync` as well as `V: Send`.
unsafe impl<V: Send + Sync> Sync for StringSlot<V> {}

/// Result of [`ConcurrentStringMap::acquire`]: either the entry already
/// existed, or the caller now holds the exclusive right to fill a freshly
/// claimed slot.
pub enum Acquired<'a, V> {
    Existing(&'a V),
    Vacant(VacantSlot<'a, V>),
}

/// Exclusive permission to publish a value into a slot this thread just
/// claimed (its key cell is `PENDING` and no other thread may touch it).
pub struct VacantSlot<'a, V> {
    map: &'a ConcurrentStringMap<V>,
    index: usize,
}

impl<'a, V> VacantSlot<'a, V> {
    /// Publish `value` under `key`, resolving the slot. Any thread that
    /// subsequently observes this slot's key via an acquire load is
    /// guaranteed to also observe `value` (the key store is the release
    /// half of the pair).
    pub fn fill(self, key: &str, value: V) -> &'a V {
        let slot = self.map.array.get(self.index);
        // SAFETY: this slot's key is `PENDING`, so no other thread will read
        // or write `value` until we release-store the real key below.
        unsafe { *slot.value.get() = value };
        let owned = Box::into_raw(Box::new(key.to_owned()));
        slot.key.store(owned, Ordering::Release);
        // SAFETY: we just published the value this key now guards.
        unsafe { &*slot.value.get() }
    }
}

pub struct ConcurrentStringMap<V> {
    array: Cga<StringSlot<V>>,
}

impl<V: Default> ConcurrentStringMap<V> {
    pub fn with_capacity(initial_cap: usize) -> Self {
        Self {
            array: Cga::with_capacity_and_load_factor(initial_cap, 0.75),
        }
    }

    fn rehash_migrate() -> impl FnMut(&mut [StringSlot<V>], &mut [StringSlot<V>]) {
        |old, new| {
            let new_cap = new.len();
            for slot in old.iter_mut() {
                let k = *slot.key.get_mut();
                if k.is_null() {
                    continue;
                }
                debug_assert_ne!(k, pending(), "rehash observed a claimed-but-unfilled slot");
                // Transfer ownership of the key pointer before this old slot
                // is freed, so its `Drop` doesn't also free it.
                *slot.key.get_mut() = ptr::null_mut();
                let key_str: &str = unsafe { &*k };
                let mut idx = hash_str(key_str) & (new_cap - 1);
                loop {
                    if new[idx].key.get_mut().is_null() {
                        *new[idx].key.get_mut() = k;
                        *new[idx].value.get_mut() = std::mem::take(slot.value.get_mut());
                        break;
                    }
                    idx = (idx + 1) & (new_cap - 1);
                }
            }
        }
    }

    /// Find `key`'s existing entry, or claim an empty slot for it.
    pub fn acquire<'a>(
        &'a self,
        qp: &QuiescentState,
        handle: &ReaderHandle,
        key: &str,
    ) -> Acquired<'a, V> {
        let mut migrate = Self::rehash_migrate();
        self.array.reserve(qp, handle, &mut migrate);

        let cap = self.array.capacity();
        let mut idx = hash_str(key) & (cap - 1);
        loop {
            let slot = self.array.get(idx);
            let k = slot.key.load(Ordering::Acquire);
            if k == pending() {
                std::hint::spin_loop();
                continue;
            }
            if k.is_null() {
                match slot.key.compare_exchange(
                    ptr::null_mut(),
                    pending(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Acquired::Vacant(VacantSlot { map: self, index: idx }),
                    // Another inserter claimed it first; re-examine the same
                    // slot (it's now `PENDING` or resolved).
                    Err(_) => continue,
                }
            }
            // SAFETY: `k` is neither null nor `pending`, so it points to a
            // `String` published by a completed `VacantSlot::fill`.
            let existing = unsafe { &*k };
            if existing.as_str() == key {
                self.array.drop_reservation();
                // SAFETY: the value was published before this key (the
                // release store in `fill`), and we observed the key with an
                // acquire load above.
                return Acquired::Existing(unsafe { &*slot.value.get() });
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    /// Insert `value` under `key` if absent, otherwise return the winning
    /// entry from whichever insertion (possibly this one) landed first.
    pub fn add<'a>(
        &'a self,
        qp: &QuiescentState,
        handle: &ReaderHandle,
        key: &str,
        value: V,
    ) -> &'a V {
        match self.acquire(qp, handle, key) {
            Acquired::Existing(v) => v,
            Acquired::Vacant(slot) => slot.fill(key, value),
        }
    }

    /// Reference to `key`'s value, without claiming an insertion right.
    /// Skips `PENDING` slots by spinning, per the spec's probe sequence.
    pub(crate) fn get_ref(&self, key: &str) -> Option<&V> {
        let cap = self.array.capacity();
        let mut idx = hash_str(key) & (cap - 1);
        loop {
            let slot = self.array.get(idx);
            let k = slot.key.load(Ordering::Acquire);
            if k == pending() {
                std::hint::spin_loop();
                continue;
            }
            if k.is_null() {
                return None;
            }
            let existing = unsafe { &*k };
            if existing.as_str() == key {
                return Some(unsafe { &*slot.value.get() });
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    /// `key`'s value, or `default` if absent. The "assert presence" variant
    /// the spec also describes is [`Self::get`] (see `SPEC_FULL.md` §1.1).
    pub fn get_or(&self, key: &str, default: V) -> V
    where
        V: Clone,
    {
        self.get_ref(key).cloned().unwrap_or(default)
    }

    /// `key`'s value, or `None` if absent.
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.get_ref(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    /// One-pass iterator over every currently resolved key. Must be used
    /// inside a reader region; concurrent insertions may or may not appear.
    ///
    /// Full-capacity scan, not a count-bounded one: entries land wherever
    /// `hash(key)` probes them to, not packed into `[0, len())` the way
    /// `Cga::iter` assumes a plain append-only array is. Must cover every
    /// slot up to `capacity()`, the same range `rehash_migrate` scans.
    pub fn keys(&self) -> Keys<'_, V> {
        Keys {
            array: &self.array,
            idx: 0,
            end: self.array.capacity(),
        }
    }
}

fn hash_str(s: &str) -> usize {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish() as usize
}

pub struct Keys<'a, V> {
    array: &'a Cga<StringSlot<V>>,
    idx: usize,
    end: usize,
}

impl<'a, V> Iterator for Keys<'a, V> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        while self.idx < self.end {
            let i = self.idx;
            self.idx += 1;
            let slot = self.array.get(i);
            let k = slot.key.load(Ordering::Acquire);
            if k.is_null() || k == pending() {
                continue;
            }
            // SAFETY: as in `acquire`, a non-sentinel key points to a live,
            // published `String`.
            return Some(unsafe { &*k });
        }
        None
    }
}

//! The call-graph store: nodes, edges, labels, and the file/username
//! indices, layered on [`crate::cga`], [`crate::chs`] and [`crate::csm`].
//!
//! A [`CallGraph`] is created empty, grown by many concurrent parser-worker
//! threads calling the `add_*`/`set_*` mutators, then read by a
//! single-threaded front-end through the `get_*`/`has_*`/`nodes_for_*`
//! queries. Every operation here runs inside a scoped reader region on the
//! calling thread's [`ReaderHandle`] (§4.1/§5 of the design): mutators and
//! scalar queries open and close their own region per call; operations that
//! return an iterator instead borrow a region the caller already holds open,
//! so the borrow checker ties the iterator's lifetime to that region.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use once_cell::sync::OnceCell;

use crate::cga::Cga;
use crate::chs::{self, ConcurrentWordSet};
use crate::csm::{self, ConcurrentStringMap};
use crate::error::CoreError;
use crate::ppc::PublishedPtr;
use crate::qp::{QuiescentState, ReaderGuard, ReaderHandle};

/// A node index. Stable for the lifetime of the graph once assigned (I1).
pub type NodeIndex = usize;

#[derive(Debug, Clone)]
struct Location {
    file: String,
    line: Option<u32>,
}

/// A function or function-pointer slot.
///
/// `location` is write-once: [`once_cell::sync::OnceCell::set`] returning
/// `Err` on a second call is exactly I6's "ignored" semantics, so there is no
/// separate no-op branch to get wrong. `username` freezes only once `location`
/// is set — until then, repeated `set_username` calls overwrite it, per the
/// call-graph store's operation contract for `set_username`. `external`
/// starts `true` and may only transition to `false` (I5).
struct Node {
    name: String,
    username: Mutex<Option<String>>,
    location: OnceCell<Location>,
    external: AtomicBool,
    callers: ConcurrentWordSet,
    calls: ConcurrentWordSet,
    refs: ConcurrentWordSet,
}

impl Node {
    fn new(name: &str) -> Self {
        Node {
            name: name.to_owned(),
            username: Mutex::new(None),
            location: OnceCell::new(),
            external: AtomicBool::new(true),
            callers: ConcurrentWordSet::default(),
            calls: ConcurrentWordSet::default(),
            refs: ConcurrentWordSet::default(),
        }
    }
}

impl Default for Node {
    fn default() -> Self {
        Node {
            name: String::new(),
            username: Mutex::new(None),
            location: OnceCell::new(),
            external: AtomicBool::new(true),
            callers: ConcurrentWordSet::default(),
            calls: ConcurrentWordSet::default(),
            refs: ConcurrentWordSet::default(),
        }
    }
}

fn node_migrate() -> impl FnMut(&mut [Node], &mut [Node]) {
    |old, new| {
        for (i, slot) in old.iter_mut().enumerate() {
            new[i] = std::mem::take(slot);
        }
    }
}

type LabelMap = ConcurrentStringMap<ConcurrentWordSet>;

/// Concurrent in-memory call-graph store.
///
/// Construction is parameter-free (§10.3 of `SPEC_FULL.md`): there is no
/// file format, wire protocol, or environment variable in the core.
pub struct CallGraph {
    qp: QuiescentState,
    nodes: Cga<Node>,
    by_name: ConcurrentStringMap<NodeIndex>,
    by_username: ConcurrentStringMap<NodeIndex>,
    by_file: ConcurrentStringMap<ConcurrentWordSet>,
    /// Owning pointer to the label map, atomically replaceable by
    /// [`CallGraph::reset_labels`] (I7). `labels_mutex` serialises concurrent
    /// resets the same way [`crate::cga::Cga`]'s `grow_mutex` serialises
    /// concurrent resizes — only one thread may own the swap at a time.
    labels: PublishedPtr<LabelMap>,
    labels_mutex: Mutex<()>,
}

impl Default for CallGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CallGraph {
    pub fn new() -> Self {
        let initial_labels: *mut LabelMap = Box::into_raw(Box::new(LabelMap::with_capacity(4)));
        CallGraph {
            qp: QuiescentState::new(),
            nodes: Cga::with_capacity(16),
            by_name: ConcurrentStringMap::with_capacity(16),
            by_username: ConcurrentStringMap::with_capacity(16),
            by_file: ConcurrentStringMap::with_capacity(8),
            labels: PublishedPtr::new(initial_labels),
            labels_mutex: Mutex::new(()),
        }
    }

    /// Register a new reader thread (a parser worker, or the front-end) and
    /// obtain its handle. Every subsequent call into this graph from that
    /// thread uses this handle.
    pub fn register(&self) -> ReaderHandle {
        self.qp.register()
    }

    fn node(&self, i: NodeIndex) -> &Node {
        if i >= self.nodes.len() {
            panic!("{}", CoreError::IndexOutOfRange(i));
        }
        self.nodes.get(i)
    }

    fn labels_map(&self) -> &LabelMap {
        // SAFETY: `reset_labels` only frees a previous label map after
        // `QuiescentState::synchronize` confirms no reader region that could
        // have loaded this pointer is still open, and this call itself runs
        // inside an open region.
        unsafe { &*self.labels.load() }
    }

    // --- mutators -----------------------------------------------------

    /// Look up `name` (by username first, then canonical name), creating a
    /// new external node if absent. Idempotent: a second call with the same
    /// name, from any thread, returns the same index (I3).
    pub fn add_external(&self, handle: &ReaderHandle, name: &str) -> NodeIndex {
        let _region = handle.region();
        if let Some(i) = self.by_username.get(name) {
            return i;
        }
        if let Some(i) = self.by_name.get(name) {
            return i;
        }

        let mut migrate = node_migrate();
        let idx = self.nodes.reserve(&self.qp, handle, &mut migrate);
        // SAFETY: we just reserved `idx` exclusively; no other thread can
        // observe it until we publish it into `by_name` below.
        unsafe { self.nodes.replace(idx, Node::new(name)) };

        let winner = *self.by_name.add(&self.qp, handle, name, idx);
        if winner != idx {
            // Benign race (§4.6): both threads allocated a Node record, only
            // one gets indexed. The loser sits in `nodes` until the graph is
            // dropped.
            log::trace!(
                "add_external({name:?}): discarding losing node allocation at index {idx}, winner is {winner}"
            );
        }
        winner
    }

    /// Clear `external` on node `i`. Idempotent; `external` never goes back
    /// to `true` (I5).
    pub fn set_defined(&self, handle: &ReaderHandle, i: NodeIndex) {
        let _region = handle.region();
        self.node(i).external.store(false, Ordering::Release);
    }

    /// Set `i`'s display alias. Frozen by `location` (I6), not by a prior
    /// `set_username` call: while no location is recorded yet, each call
    /// overwrites the alias and re-indexes it into `by_username`; once
    /// `set_location` has run, further calls are ignored regardless of
    /// whether they agree with the stored alias — see `SPEC_FULL.md` §1.1
    /// for why this crate resolves the spec's open question in favor of
    /// "ignored" rather than an assertion failure.
    pub fn set_username(&self, handle: &ReaderHandle, i: NodeIndex, username: &str) {
        let _region = handle.region();
        let node = self.node(i);
        if node.location.get().is_some() {
            return;
        }
        *node.username.lock().unwrap() = Some(username.to_owned());
        self.by_username.add(&self.qp, handle, username, i);
    }

    /// Set `i`'s source location. Write-once (I6): ignored once a location
    /// is already recorded.
    pub fn set_location(&self, handle: &ReaderHandle, i: NodeIndex, file: &str, line: Option<u32>) {
        let _region = handle.region();
        let node = self.node(i);
        let loc = Location {
            file: file.to_owned(),
            line,
        };
        if node.location.set(loc).is_ok() {
            let set = self
                .by_file
                .add(&self.qp, handle, file, ConcurrentWordSet::default());
            set.insert(&self.qp, handle, i);
        }
    }

    /// Insert `a -> b`: `a` into `b`'s callers, and `b` into `a`'s calls (if
    /// `is_call`) or refs (otherwise). Both sides are inserted unconditionally
    /// (I4).
    pub fn add_edge(&self, handle: &ReaderHandle, a: NodeIndex, b: NodeIndex, is_call: bool) {
        let _region = handle.region();
        self.node(b).callers.insert(&self.qp, handle, a);
        let node_a = self.node(a);
        if is_call {
            node_a.calls.insert(&self.qp, handle, b);
        } else {
            node_a.refs.insert(&self.qp, handle, b);
        }
    }

    /// Insert `i` into `label`'s node set.
    pub fn add_label(&self, handle: &ReaderHandle, i: NodeIndex, label: &str) {
        let _region = handle.region();
        let set = self
            .labels_map()
            .add(&self.qp, handle, label, ConcurrentWordSet::default());
        set.insert(&self.qp, handle, i);
    }

    /// Atomically replace the label map with a fresh, empty one (I7). Blocks
    /// until every reader region that could have observed the old map has
    /// ended before freeing it.
    pub fn reset_labels(&self, handle: &ReaderHandle) {
        let _region = handle.region();
        let _writer = self.labels_mutex.lock().unwrap();

        let new_map: *mut LabelMap = Box::into_raw(Box::new(LabelMap::with_capacity(4)));
        // SAFETY: `_writer` makes us the only thread swapping `labels` right
        // now.
        let old_map = unsafe { self.labels.load_owner() };
        self.labels.store(new_map);

        handle.pause_region();
        self.qp.synchronize();
        handle.resume_region();

        // SAFETY: `synchronize` guarantees no reader that could have
        // dereferenced `old_map` is still doing so.
        drop(unsafe { Box::from_raw(old_map) });
    }

    // --- scalar queries -------------------------------------------------

    pub fn node_count(&self, handle: &ReaderHandle) -> usize {
        let _region = handle.region();
        self.nodes.len()
    }

    /// Look up `name` (by username first, then canonical name) without
    /// creating a node.
    pub fn get_node(&self, handle: &ReaderHandle, name: &str) -> Option<NodeIndex> {
        let _region = handle.region();
        self.by_username
            .get(name)
            .or_else(|| self.by_name.get(name))
    }

    pub fn name_of(&self, handle: &ReaderHandle, i: NodeIndex) -> String {
        let _region = handle.region();
        self.node(i).name.clone()
    }

    pub fn username_of(&self, handle: &ReaderHandle, i: NodeIndex) -> Option<String> {
        let _region = handle.region();
        self.node(i).username.lock().unwrap().clone()
    }

    pub fn location_of(&self, handle: &ReaderHandle, i: NodeIndex) -> Option<(String, Option<u32>)> {
        let _region = handle.region();
        self.node(i)
            .location
            .get()
            .map(|loc| (loc.file.clone(), loc.line))
    }

    pub fn is_external(&self, handle: &ReaderHandle, i: NodeIndex) -> bool {
        let _region = handle.region();
        self.node(i).external.load(Ordering::Acquire)
    }

    /// True if `b` is in `a.calls`, or (`ref_ok` and `b` is not external and
    /// `b` is in `a.refs`) — cross-TU references to undefined symbols are
    /// not call edges by policy.
    pub fn has_edge(&self, handle: &ReaderHandle, a: NodeIndex, b: NodeIndex, ref_ok: bool) -> bool {
        let _region = handle.region();
        if self.node(a).calls.contains(b) {
            return true;
        }
        ref_ok && !self.node(b).external.load(Ordering::Acquire) && self.node(a).refs.contains(b)
    }

    pub fn has_call_edge(&self, handle: &ReaderHandle, a: NodeIndex, b: NodeIndex) -> bool {
        let _region = handle.region();
        self.node(a).calls.contains(b)
    }

    pub fn has_label(&self, handle: &ReaderHandle, i: NodeIndex, label: &str) -> bool {
        let _region = handle.region();
        self.labels_map()
            .get_ref(label)
            .map(|set| set.contains(i))
            .unwrap_or(false)
    }

    /// A read-only snapshot of the graph's size, composed from the same
    /// accessors the spec's other queries already use.
    pub fn stats(&self, handle: &ReaderHandle) -> Stats {
        let _region = handle.region();
        Stats {
            node_count: self.nodes.len(),
            file_count: self.by_file.len(),
            label_count: self.labels_map().len(),
        }
    }

    // --- iterator queries -----------------------------------------------
    //
    // These borrow an already-open `ReaderGuard<'a>` rather than opening
    // their own region, so the returned iterator's lifetime is tied to it at
    // compile time: the guard must outlive every step of the iteration.

    pub fn get_callers<'a>(&'a self, region: &'a ReaderGuard<'a>, i: NodeIndex) -> Callers<'a> {
        Callers {
            inner: self.node(i).callers.iter(),
            _region: region,
        }
    }

    pub fn get_callees<'a>(&'a self, region: &'a ReaderGuard<'a>, i: NodeIndex) -> Callees<'a> {
        Callees {
            inner: self.node(i).calls.iter(),
            _region: region,
        }
    }

    pub fn get_refs<'a>(&'a self, region: &'a ReaderGuard<'a>, i: NodeIndex) -> Refs<'a> {
        Refs {
            inner: self.node(i).refs.iter(),
            _region: region,
        }
    }

    pub fn nodes_for_file<'a>(&'a self, region: &'a ReaderGuard<'a>, file: &str) -> NodesForFile<'a> {
        NodesForFile {
            inner: self.by_file.get_ref(file).map(ConcurrentWordSet::iter),
            _region: region,
        }
    }

    pub fn nodes_for_label<'a>(&'a self, region: &'a ReaderGuard<'a>, label: &str) -> NodesForLabel<'a> {
        NodesForLabel {
            inner: self.labels_map().get_ref(label).map(ConcurrentWordSet::iter),
            _region: region,
        }
    }

    /// Snapshot of currently-known file names at call time.
    pub fn all_files<'a>(&'a self, region: &'a ReaderGuard<'a>) -> Files<'a> {
        Files {
            inner: self.by_file.keys(),
            _region: region,
        }
    }

    /// Snapshot of currently-known label names at call time.
    pub fn all_labels<'a>(&'a self, region: &'a ReaderGuard<'a>) -> Labels<'a> {
        Labels {
            inner: self.labels_map().keys(),
            _region: region,
        }
    }
}

impl Drop for CallGraph {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no reader is active and this `CallGraph`
        // owns the label map exclusively.
        let ptr = unsafe { self.labels.load_owner() };
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// A read-only snapshot of graph size, as of the call to [`CallGraph::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub node_count: usize,
    pub file_count: usize,
    pub label_count: usize,
}

macro_rules! region_bound_iter {
    ($name:ident, $inner:ty, $item:ty) => {
        pub struct $name<'a> {
            inner: $inner,
            #[allow(dead_code)]
            _region: &'a ReaderGuard<'a>,
        }

        impl<'a> Iterator for $name<'a> {
            type Item = $item;

            fn next(&mut self) -> Option<$item> {
                self.inner.next()
            }
        }
    };
}

region_bound_iter!(Callers, chs::Iter<'a>, NodeIndex);
region_bound_iter!(Callees, chs::Iter<'a>, NodeIndex);
region_bound_iter!(Refs, chs::Iter<'a>, NodeIndex);
region_bound_iter!(Files, csm::Keys<'a, ConcurrentWordSet>, &'a str);
region_bound_iter!(Labels, csm::Keys<'a, ConcurrentWordSet>, &'a str);

pub struct NodesForFile<'a> {
    inner: Option<chs::Iter<'a>>,
    #[allow(dead_code)]
    _region: &'a ReaderGuard<'a>,
}

impl<'a> Iterator for NodesForFile<'a> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<NodeIndex> {
        self.inner.as_mut()?.next()
    }
}

pub struct NodesForLabel<'a> {
    inner: Option<chs::Iter<'a>>,
    #[allow(dead_code)]
    _region: &'a ReaderGuard<'a>,
}

impl<'a> Iterator for NodesForLabel<'a> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<NodeIndex> {
        self.inner.as_mut()?.next()
    }
}

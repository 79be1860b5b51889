//! A concurrent in-memory call-graph store: parallel parser-worker threads
//! publish nodes, edges, and labels with zero locking on the fast path,
//! while a single-threaded front-end runs unsynchronised read-only queries
//! against the result.
//!
//! The crate is layered bottom-up, each layer built only on those below it:
//!
//! - [`qp`] — a lightweight, user-space read-copy-update (RCU) quiescence
//!   primitive. Reader threads register a handle and enter/exit scoped
//!   regions; a writer that needs to reclaim storage calls `synchronize()`
//!   and blocks until every reader that was mid-region has left it.
//! - [`ppc`] — a published-pointer cell: one atomic pointer with
//!   acquire/release publish semantics, used to swap a container's backing
//!   storage (or an owning pointer to a whole sub-structure) without a
//!   reader ever observing a torn or freed value.
//! - [`cga`] — a concurrent growable array: append-only, amortised-doubling,
//!   the substrate the hash-based containers above it rehash into.
//! - [`chs`] — an open-addressed concurrent set of machine words (node
//!   indices), built on [`cga::Cga`].
//! - [`csm`] — an open-addressed concurrent string-keyed map with
//!   single-insertion-wins semantics, also built on [`cga::Cga`].
//! - [`graph`] — the call-graph entity itself: [`graph::CallGraph`], layered
//!   on the four containers above.
//!
//! There is no node or edge deletion, no durability, and no multi-process
//! sharing (see `SPEC_FULL.md` §12); within one load session the graph only
//! grows. The one exception is [`graph::CallGraph::reset_labels`], a
//! wholesale atomic replacement of the label index.
//!
//! # Error model
//!
//! Nothing on a query path returns `Result`: absence is data (`None`, an
//! empty iterator, `false`). The conditions in [`error::CoreError`] — a
//! recursive reader-region entry, an out-of-range node index — are
//! programming errors and `panic!`, matching the spec's "no exception or
//! error code propagates across the API boundary."
//!
//! # Example
//!
//! ```
//! use callgraph_rcu::graph::CallGraph;
//!
//! let g = CallGraph::new();
//! let h = g.register();
//!
//! let caller = g.add_external(&h, "main");
//! g.set_defined(&h, caller);
//! let callee = g.add_external(&h, "helper");
//! g.set_defined(&h, callee);
//! g.add_edge(&h, caller, callee, true);
//!
//! assert!(g.has_call_edge(&h, caller, callee));
//! let region = h.region();
//! assert_eq!(g.get_callees(&region, caller).collect::<Vec<_>>(), vec![callee]);
//! ```

pub mod cga;
pub mod chs;
pub mod csm;
pub mod error;
pub mod graph;
pub mod ppc;
pub mod qp;

pub use error::CoreError;
pub use graph::{CallGraph, NodeIndex, Stats};
pub use qp::{QuiescentState, ReaderGuard, ReaderHandle};

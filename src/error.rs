//! Error taxonomy for conditions that are, per design, programming errors
//! rather than ordinary failures.
//!
//! Nothing in this crate returns `Result` from a query path: absence is data
//! (`Option`, an empty iterator, `false`), not an error. `CoreError` exists
//! for the small set of conditions that indicate misuse of the API itself —
//! these are normally surfaced as a `panic!`, with `CoreError` giving that
//! panic a consistent message and giving an embedder that wraps this crate
//! behind its own API a typed value to match on via `try_*` entry points.
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum CoreError {
    /// A reader handle attempted to enter a region while already inside one.
    #[error("recursive rcu reader region entry on the same handle")]
    ReentrantReaderRegion,

    /// A node index was out of range for the graph it was used against.
    #[error("node index {0} is out of range")]
    IndexOutOfRange(usize),
}

//! facegraph-store — Shared mutable state of the identification service:
//! the in-memory similarity index and the SQLite-backed identity graph.
//!
//! These are the only components with shared mutable state; every
//! mutation runs inside a scoped transaction (graph) or behind a write
//! lock (index), so concurrent queries see either the pre- or post-update
//! state, never a partial write.

pub mod graph;
pub mod index;

pub use graph::{EdgeRow, GraphStore, IdentityAttrs, IdentityRow, RankedMatch, StoreError};
pub use index::SimilarityIndex;

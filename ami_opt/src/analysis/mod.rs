//! Structural analyses over a CFG
//!
//! Each analysis computes a typed result that the pass manager caches and
//! invalidates; running one as a pass also mirrors the result into
//! namespaced metadata for the writer.

pub mod defs;
pub mod djgraph;
pub mod domtree;
pub mod live;

pub use defs::DefsAnalysis;
pub use djgraph::DjGraph;
pub use domtree::DomTree;
pub use live::LiveAnalysis;

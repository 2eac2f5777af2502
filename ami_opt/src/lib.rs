//! Analyses and optimisation passes for the A-Mi middle-end
//!
//! The pass manager in [`manager`] is the entry point: it parses pass
//! specifications (`id(arg, key=value)`), runs passes over a CFG, caches
//! analysis results and tracks their validity across transformations.

pub mod analysis;
pub mod dataflow;
pub mod expr;
pub mod gvn;
pub mod manager;
pub mod predicates;
pub mod regalloc;
pub mod simplify;
pub mod ssa;
pub mod vdcm;

pub use expr::{Expr, ExprOp};
pub use manager::{PassManager, PassSpec};

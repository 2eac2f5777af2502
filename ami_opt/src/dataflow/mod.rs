//! Availability and anticipatability over value-numbered expressions
//!
//! Both analyses work on the set lattice of canonical expressions produced
//! by a GVN pass, reaching their fixpoints by monotone iteration.

pub mod anticipatable;
pub mod available;

pub use anticipatable::AntAnalysis;
pub use available::AvailAnalysis;

use crate::expr::Expr;
use std::collections::BTreeSet;

pub type ExprSet = BTreeSet<Expr>;

/// Render an expression set as its Polish encodings, for metadata.
pub fn polish_list(set: &ExprSet) -> Vec<String> {
    set.iter().map(Expr::polish).collect()
}

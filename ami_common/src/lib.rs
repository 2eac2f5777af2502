//! Shared utilities and error types for the A-Mi middle-end
//!
//! This crate provides functionality used across all middle-end components:
//! - Error types and handling utilities
//! - The integer semantics shared by the interpreter and the expression algebra

pub mod error;
pub mod ints;

pub use error::*;
pub use ints::*;

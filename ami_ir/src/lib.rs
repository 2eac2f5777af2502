//! A-Mi intermediate representation
//!
//! This crate defines the three-address IR the middle-end operates on:
//! - Instructions and operands
//! - Basic blocks with parent/child flow descriptors
//! - The control-flow graph with invariant-preserving edge editing
//! - The metadata store shared by analyses
//! - The textual reader and writer for A-Mi source

pub mod block;
pub mod cfg;
pub mod instruction;
pub mod metadata;
pub mod reader;
pub mod writer;

pub use block::BasicBlock;
pub use cfg::Cfg;
pub use instruction::{BinaryOp, Instruction, InstructionKind, Operand};
pub use metadata::Metadata;
pub use reader::{CfgBuilder, ReaderOptions};
pub use writer::CfgWriter;

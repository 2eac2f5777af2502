//! Subcommand implementations

pub mod opt;
pub mod run;

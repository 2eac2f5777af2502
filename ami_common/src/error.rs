//! Error handling utilities for the A-Mi middle-end

use thiserror::Error;

/// The main error type for the A-Mi middle-end
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmiError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("program is empty")]
    EmptyCfg,

    #[error("entrypoint {label} does not exist")]
    NoEntryPoint { label: String },

    #[error("line {line}: basic blocks must be explicitly labelled")]
    AnonymousBlock { line: usize },

    #[error("unknown label {label}")]
    BadLabel { label: String },

    #[error("bad flow out of {block}: {message}")]
    BadFlow { block: String, message: String },

    #[error("bad phi in {block}: {message}")]
    BadPhi { block: String, message: String },

    #[error("pass {pass} received an invalid argument: {message}")]
    BadArgument { pass: String, message: String },

    #[error("[{block}:{index}] {message}")]
    Opt {
        block: String,
        index: usize,
        message: String,
    },

    #[error("load error: {message}")]
    Load { message: String },

    #[error("[{block}:{index}] unknown instruction: {message}")]
    UnknownInstruction {
        block: String,
        index: usize,
        message: String,
    },

    #[error("[{block}:{index}] division by zero")]
    DivisionByZero { block: String, index: usize },
}

/// Result type alias for A-Mi middle-end operations
pub type AmiResult<T> = Result<T, AmiError>;

impl AmiError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse { line, message: message.into() }
    }

    pub fn bad_label(label: impl Into<String>) -> Self {
        Self::BadLabel { label: label.into() }
    }

    pub fn bad_flow(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadFlow { block: block.into(), message: message.into() }
    }

    pub fn bad_phi(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadPhi { block: block.into(), message: message.into() }
    }

    pub fn bad_argument(pass: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadArgument { pass: pass.into(), message: message.into() }
    }

    pub fn opt(block: impl Into<String>, index: usize, message: impl Into<String>) -> Self {
        Self::Opt { block: block.into(), index, message: message.into() }
    }

    pub fn load(message: impl Into<String>) -> Self {
        Self::Load { message: message.into() }
    }
}

//! Error taxonomy for every phase of the linker pipeline.
//!
//! Within a phase, errors are collected into a [`LinkErrors`] list rather
//! than failing fast, so a single run can report every undefined symbol,
//! duplicate definition, and overflow it finds. Between phases, a non-empty
//! error list aborts the remaining pipeline.

use std::fmt;
use std::io;

/// A single linker failure.
#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error("parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("unsupported object format in {file}: {message}")]
    UnsupportedFormat { file: String, message: String },

    #[error("archive error in {file}: {message}")]
    Archive { file: String, message: String },

    #[error("undefined symbol: {symbol}")]
    UndefinedSymbol { symbol: String },

    #[error("duplicate definition of global symbol: {symbol}")]
    DuplicateDefinition { symbol: String },

    #[error("weak symbol conflict for: {symbol}")]
    WeakSymbolConflict { symbol: String },

    #[error("type mismatch for symbol {symbol}: {message}")]
    TypeMismatch { symbol: String, message: String },

    #[error("relocation value out of range for symbol {symbol}: {detail}")]
    RangeOverflow { symbol: String, detail: i64 },

    #[error("misaligned relocation target for symbol {symbol}: offset {detail:#x}")]
    Misalignment { symbol: String, detail: u64 },

    #[error("allocation failed: {message}")]
    AllocationFailed { message: String },

    #[error("I/O error on {file}: {source}")]
    Io { file: String, source: io::Error },
}

/// Result alias for single-error operations (parsing, decoding).
pub type Result<T> = std::result::Result<T, LinkError>;

/// An accumulated, non-empty-checked list of [`LinkError`]s produced by one
/// phase of the pipeline.
#[derive(Debug, Default)]
pub struct LinkErrors(pub Vec<LinkError>);

impl LinkErrors {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: LinkError) {
        self.0.push(err);
    }

    pub fn extend(&mut self, errs: impl IntoIterator<Item = LinkError>) {
        self.0.extend(errs);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> std::result::Result<(), LinkErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for LinkErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "Error: {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LinkErrors {}

impl From<LinkError> for LinkErrors {
    fn from(err: LinkError) -> Self {
        Self(vec![err])
    }
}

//! Engine-level failure taxonomy.
//!
//! These are `Result` errors, not cell error values. A formula that divides
//! by zero produces `Value::Error(#DIV/0!)` and evaluation succeeds; a lookup
//! of an address nothing ever defined is `EngineError::UnknownAddress` and
//! evaluation fails.

use thiserror::Error;

use crate::address::AddressError;

/// Failures raised by the formula collaborator, carried through evaluation
/// unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormulaError {
    #[error("formula parse error: {0}")]
    Parse(String),
    #[error("function {function} is not implemented")]
    NotImplemented { function: String },
    #[error("formula evaluation error: {0}")]
    Eval(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Cross-workbook references and other workbook features the graph
    /// cannot represent. Fatal, never retried.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("unknown address: {0}")]
    UnknownAddress(String),

    /// Vectorized assignment where the value count does not match the
    /// target address count.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("unrecognized file kind: {0}")]
    UnrecognizedFileKind(String),

    #[error("ambiguous file kind: {0}")]
    AmbiguousFileKind(String),

    /// Graph trimming aborted; the message carries every diagnostic line.
    #[error("trim failed:\n{0}")]
    Trim(String),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Formula(#[from] FormulaError),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True when the failure originated in the formula collaborator rather
    /// than the engine itself.
    pub fn is_formula(&self) -> bool {
        matches!(self, EngineError::Formula(_))
    }
}

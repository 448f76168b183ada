//! Executable spreadsheet dependency graphs.
//!
//! [`Compiler`] turns a workbook (seen only through a [`DataSource`]) into a
//! directed graph of cell and range nodes that can be evaluated, mutated,
//! trimmed to a minimal input/output subgraph, and serialized to disk, all
//! without the original spreadsheet application.
//!
//! The formula language is a collaborator, not a resident: formulas enter as
//! text, are compiled through an [`ExprCompiler`], and execute through
//! [`EvalContext`] callbacks bound to the engine's cache.

pub mod compiler;
pub mod formula;
pub mod graph;
pub mod node;
pub mod snapshot;
pub mod source;
pub mod trim;
pub mod verify;

pub use cellgraph_common::{
    Address, AddressError, CellAddress, CellError, CellErrorKind, EngineError, FormulaError,
    RangeAddress, Value,
};
pub use compiler::Compiler;
pub use formula::{CompiledExpr, EvalContext, ExprCompiler};
pub use node::{CellNode, Formula, Node, RangeNode};
pub use snapshot::SAVE_FILE_EXTENSIONS;
pub use source::{DataSource, RangeData, RangeFormulas, ReplayEntry, ReplaySource};
pub use verify::{FailedCell, Mismatch, ValidationReport, close_enough};

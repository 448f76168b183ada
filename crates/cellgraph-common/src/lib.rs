pub mod address;
pub mod error;
pub mod value;

pub use address::{Address, AddressError, CellAddress, RangeAddress};
pub use error::{EngineError, FormulaError};
pub use value::{CellError, CellErrorKind, Value};

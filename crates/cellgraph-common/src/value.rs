//! Cell values as seen by the evaluation engine.
//!
//! - **`CellErrorKind`** : the canonical set of cell error codes
//! - **`CellError`**     : an error *value* (`#VALUE!`, `#REF!`, ...) that a
//!   cell can hold; distinct from the `Result` errors in [`crate::error`]
//! - **`Value`**         : everything a node's cache slot can contain

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Recognised cell error codes.
///
/// Names are CamelCase while `Display` renders them exactly as a spreadsheet
/// shows them (`#DIV/0!`, ...).
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CellErrorKind {
    Null,
    Div,
    Value,
    Ref,
    Name,
    Num,
    Na,
}

impl fmt::Display for CellErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Null => "#NULL!",
            Self::Div => "#DIV/0!",
            Self::Value => "#VALUE!",
            Self::Ref => "#REF!",
            Self::Name => "#NAME?",
            Self::Num => "#NUM!",
            Self::Na => "#N/A",
        })
    }
}

impl CellErrorKind {
    /// Parse a display code back into a kind. Used when reloading text
    /// snapshots, where error values round-trip as their display strings.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "#NULL!" => Some(Self::Null),
            "#DIV/0!" => Some(Self::Div),
            "#VALUE!" => Some(Self::Value),
            "#REF!" => Some(Self::Ref),
            "#NAME?" => Some(Self::Name),
            "#NUM!" => Some(Self::Num),
            "#N/A" => Some(Self::Na),
            _ => None,
        }
    }
}

/// An error value held by a cell.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellError {
    pub kind: CellErrorKind,
    pub message: Option<String>,
}

impl CellError {
    pub fn new(kind: CellErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.message = Some(msg.into());
        self
    }
}

impl From<CellErrorKind> for CellError {
    fn from(kind: CellErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref msg) = self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

/// The coercion sentinel cached when a formula produces a collection where a
/// scalar was expected.
pub const VALUE_ERROR: CellErrorKind = CellErrorKind::Value;

/// Everything a node's cached slot (or a raw workbook cell) can hold.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Number(f64),
    Text(String),
    Bool(bool),
    /// Row-major grid, the aggregate value of a range.
    Array(Vec<Vec<Value>>),
    /// A reference result; dereferenced on every read during evaluation.
    Ref(Address),
    Empty,
    Error(CellError),
}

impl Value {
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Numeric view used by value comparisons; `Int` and `Number` compare
    /// through this, everything else is `None`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Flatten row-major, leaving scalars as a single element.
    pub fn flatten(&self) -> Vec<Value> {
        match self {
            Value::Array(rows) => rows.iter().flat_map(|r| r.iter().cloned()).collect(),
            v => vec![v.clone()],
        }
    }

    /// Drop trailing singleton dimensions: an N x 1 grid becomes a flat
    /// column, a 1 x N grid a flat row, a 1 x 1 grid a scalar.
    pub fn collapse(self) -> Value {
        let mut rows = match self {
            Value::Array(rows) => rows,
            other => return other,
        };
        if rows.is_empty() {
            return Value::Array(rows);
        }
        if rows[0].len() == 1 {
            let col: Vec<Value> = rows
                .into_iter()
                .map(|mut r| if r.is_empty() { Value::Empty } else { r.remove(0) })
                .collect();
            rows = vec![col];
            if rows[0].len() == 1 {
                return rows.remove(0).remove(0);
            }
            return Value::Array(rows);
        }
        if rows.len() == 1 {
            return Value::Array(vec![rows.remove(0)]);
        }
        Value::Array(rows)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Array(a) => write!(f, "{a:?}"),
            Value::Ref(a) => write!(f, "{a}"),
            Value::Empty => write!(f, ""),
            Value::Error(e) => write!(f, "{e}"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<CellError> for Value {
    fn from(e: CellError) -> Self {
        Value::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip() {
        for kind in [
            CellErrorKind::Null,
            CellErrorKind::Div,
            CellErrorKind::Value,
            CellErrorKind::Ref,
            CellErrorKind::Name,
            CellErrorKind::Num,
            CellErrorKind::Na,
        ] {
            assert_eq!(CellErrorKind::parse(&kind.to_string()), Some(kind));
        }
        assert_eq!(CellErrorKind::parse("#BOGUS!"), None);
    }

    #[test]
    fn collapse_drops_trailing_singletons() {
        let col = Value::Array(vec![
            vec![Value::Int(1)],
            vec![Value::Int(2)],
            vec![Value::Int(3)],
        ]);
        assert_eq!(
            col.collapse(),
            Value::Array(vec![vec![Value::Int(1), Value::Int(2), Value::Int(3)]])
        );

        let row = Value::Array(vec![vec![Value::Int(1), Value::Int(2)]]);
        assert_eq!(
            row.collapse(),
            Value::Array(vec![vec![Value::Int(1), Value::Int(2)]])
        );

        let single = Value::Array(vec![vec![Value::Int(7)]]);
        assert_eq!(single.collapse(), Value::Int(7));

        let grid = Value::Array(vec![
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::Int(3), Value::Int(4)],
        ]);
        assert_eq!(grid.clone().collapse(), grid);
    }

    #[test]
    fn flatten_is_row_major() {
        let grid = Value::Array(vec![
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::Int(3), Value::Int(4)],
        ]);
        assert_eq!(
            grid.flatten(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]
        );
        assert_eq!(Value::Int(5).flatten(), vec![Value::Int(5)]);
    }
}

//! Data-source abstraction.
//!
//! The builder is written against [`DataSource`] only; it never learns
//! whether raw values come from an open workbook or a replayed snapshot.
//! Live workbook readers implement this trait outside the engine.
//! [`ReplaySource`] is the in-engine implementation backed by a flat
//! address-to-entry map, the shape the text snapshot stores.

use rustc_hash::FxHashMap;

use cellgraph_common::{Address, CellAddress, EngineError, RangeAddress, Value};

use crate::formula::parse_ref_formula;

/// Formula information a source reports for a range.
#[derive(Debug, Clone)]
pub enum RangeFormulas {
    /// No formula data; members are built by recursive per-cell lookups.
    None,
    /// Per-cell formula grid, same shape as the value grid; members are
    /// built inline from the two grids.
    PerCell(Vec<Vec<Option<String>>>),
    /// A single array formula covering the whole block; no members exist.
    Array(String),
}

/// Raw data for one resolved address.
#[derive(Debug, Clone)]
pub enum RangeData {
    Cell {
        address: CellAddress,
        value: Value,
        formula: Option<String>,
    },
    Range {
        address: RangeAddress,
        values: Vec<Vec<Value>>,
        formulas: RangeFormulas,
    },
}

impl RangeData {
    /// The canonical address the source actually resolved. May differ from
    /// the requested address (whole-row/column normalization), in which case
    /// the builder plants a redirect under the requested address.
    pub fn address(&self) -> Address {
        match self {
            RangeData::Cell { address, .. } => Address::Cell(address.clone()),
            RangeData::Range { address, .. } => Address::Range(address.clone()),
        }
    }
}

/// Supplies raw value/formula data per address.
pub trait DataSource {
    fn get_range(&self, address: &Address) -> Result<RangeData, EngineError>;
    /// Default sheet for unqualified addresses. `None` when there is no live
    /// workbook (replay).
    fn active_sheet(&self) -> Option<String>;
}

/// One stored entry of a replayed snapshot.
#[derive(Debug, Clone)]
pub enum ReplayEntry {
    Literal(Value),
    /// Formula source text, starting with `=`.
    Formula(String),
}

/// Replays a text snapshot's flat cell map with no workbook access.
#[derive(Debug, Default)]
pub struct ReplaySource {
    cells: FxHashMap<String, ReplayEntry>,
}

impl ReplaySource {
    pub fn new(entries: impl IntoIterator<Item = (String, ReplayEntry)>) -> Self {
        Self {
            cells: entries.into_iter().collect(),
        }
    }

    fn cell_data(&self, address: &CellAddress) -> RangeData {
        match self.cells.get(&address.canonical()) {
            Some(ReplayEntry::Formula(text)) => RangeData::Cell {
                address: address.clone(),
                value: Value::Empty,
                formula: Some(text.clone()),
            },
            Some(ReplayEntry::Literal(v)) => RangeData::Cell {
                address: address.clone(),
                value: v.clone(),
                formula: None,
            },
            None => RangeData::Cell {
                address: address.clone(),
                value: Value::Empty,
                formula: None,
            },
        }
    }
}

impl DataSource for ReplaySource {
    fn get_range(&self, address: &Address) -> Result<RangeData, EngineError> {
        match address {
            Address::Cell(c) => Ok(self.cell_data(c)),
            Address::Range(r) if r.is_bounded() => {
                // Assemble the value grid from member lookups. No formula
                // data is reported, which makes the builder construct each
                // member cell through its own lookup (picking up formulas).
                let grid = r.resolve_range()?;
                let values = grid
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|addr| match self.cells.get(&addr.canonical()) {
                                Some(ReplayEntry::Literal(v)) => v.clone(),
                                _ => Value::Empty,
                            })
                            .collect()
                    })
                    .collect();
                Ok(RangeData::Range {
                    address: r.clone(),
                    values,
                    formulas: RangeFormulas::None,
                })
            }
            Address::Range(_) => {
                // An unbounded range was recorded as a redirect at save
                // time; disassemble it and recurse into the target block.
                let stored = self.cells.get(&address.canonical()).ok_or_else(|| {
                    EngineError::UnknownAddress(address.canonical())
                })?;
                let ReplayEntry::Formula(text) = stored else {
                    return Err(EngineError::UnknownAddress(address.canonical()));
                };
                let inner = parse_ref_formula(text).ok_or_else(|| {
                    EngineError::Snapshot(format!(
                        "expected a reference formula at {address}, found '{text}'"
                    ))
                })?;
                self.get_range(&Address::parse(inner)?)
            }
        }
    }

    fn active_sheet(&self) -> Option<String> {
        None
    }
}

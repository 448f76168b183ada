//! A seedable in-memory workbook data source.
//!
//! Behaves like an open workbook as the engine sees one: cells report their
//! stored (last computed) value alongside any formula text, bounded ranges
//! report per-cell value and formula grids, whole-row/column requests
//! normalize to the sheet's used region (which makes the builder plant a
//! redirect), and ranges can carry a single array formula.

use std::collections::BTreeMap;

use cellgraph_common::{Address, EngineError, RangeAddress, Value};
use cellgraph_engine::source::{DataSource, RangeData, RangeFormulas};

#[derive(Debug, Clone)]
struct CellSeed {
    value: Value,
    formula: Option<String>,
}

#[derive(Debug, Default)]
struct Sheet {
    cells: BTreeMap<(u32, u32), CellSeed>,
    array_formulas: Vec<(RangeAddress, String)>,
}

#[derive(Debug)]
pub struct InMemoryWorkbook {
    sheets: BTreeMap<String, Sheet>,
    active: String,
}

impl InMemoryWorkbook {
    pub fn new(active_sheet: &str) -> Self {
        let mut sheets = BTreeMap::new();
        sheets.insert(active_sheet.to_string(), Sheet::default());
        Self {
            sheets,
            active: active_sheet.to_string(),
        }
    }

    fn parse_cell(&self, address: &str) -> (String, u32, u32) {
        let addr = Address::parse(address).expect("fixture cell address");
        let addr = if addr.has_sheet() {
            addr
        } else {
            addr.with_sheet(&self.active)
        };
        let cell = addr.as_cell().expect("fixture cell, not range").clone();
        (cell.sheet().to_string(), cell.row(), cell.col())
    }

    fn sheet_mut(&mut self, name: &str) -> &mut Sheet {
        self.sheets.entry(name.to_string()).or_default()
    }

    /// Seed a literal cell.
    pub fn set_value(&mut self, address: &str, value: impl Into<Value>) {
        let (sheet, row, col) = self.parse_cell(address);
        self.sheet_mut(&sheet).cells.insert(
            (row, col),
            CellSeed {
                value: value.into(),
                formula: None,
            },
        );
    }

    /// Seed a formula cell with no stored result.
    pub fn set_formula(&mut self, address: &str, formula: &str) {
        let (sheet, row, col) = self.parse_cell(address);
        self.sheet_mut(&sheet).cells.insert(
            (row, col),
            CellSeed {
                value: Value::Empty,
                formula: Some(formula.to_string()),
            },
        );
    }

    /// Seed a formula cell along with the value the workbook last computed
    /// for it, the way a saved spreadsheet carries both.
    pub fn set_formula_with_value(
        &mut self,
        address: &str,
        formula: &str,
        value: impl Into<Value>,
    ) {
        let (sheet, row, col) = self.parse_cell(address);
        self.sheet_mut(&sheet).cells.insert(
            (row, col),
            CellSeed {
                value: value.into(),
                formula: Some(formula.to_string()),
            },
        );
    }

    /// Register an array formula covering a whole range.
    pub fn set_array_formula(&mut self, range: &str, formula: &str) {
        let addr = Address::parse(range).expect("fixture range address");
        let addr = if addr.has_sheet() {
            addr
        } else {
            addr.with_sheet(&self.active)
        };
        let range = addr.as_range().expect("fixture range, not cell").clone();
        let sheet = range.sheet().to_string();
        self.sheet_mut(&sheet)
            .array_formulas
            .push((range, formula.to_string()));
    }

    /// Clamp an unbounded span to the sheet's used region, the way a live
    /// reader turns `A:A` into a concrete block.
    fn normalize(&self, range: &RangeAddress) -> Result<RangeAddress, EngineError> {
        let (start_row, start_col, end_row, end_col) = range.bounds();
        let cells = self
            .sheets
            .get(range.sheet())
            .map(|s| &s.cells)
            .ok_or_else(|| EngineError::UnknownAddress(range.canonical()))?;

        let bounded = if start_row == 0 {
            let last_row = cells
                .keys()
                .filter(|(_, col)| *col >= start_col && *col <= end_col)
                .map(|(row, _)| *row)
                .max()
                .unwrap_or(1);
            RangeAddress::new(range.sheet(), 1, start_col, last_row, end_col)?
        } else {
            let last_col = cells
                .keys()
                .filter(|(row, _)| *row >= start_row && *row <= end_row)
                .map(|(_, col)| *col)
                .max()
                .unwrap_or(1);
            RangeAddress::new(range.sheet(), start_row, 1, end_row, last_col)?
        };
        Ok(bounded)
    }
}

impl DataSource for InMemoryWorkbook {
    fn get_range(&self, address: &Address) -> Result<RangeData, EngineError> {
        match address {
            Address::Cell(cell) => {
                let seed = self
                    .sheets
                    .get(cell.sheet())
                    .and_then(|s| s.cells.get(&(cell.row(), cell.col())));
                Ok(RangeData::Cell {
                    address: cell.clone(),
                    value: seed.map(|s| s.value.clone()).unwrap_or(Value::Empty),
                    formula: seed.and_then(|s| s.formula.clone()),
                })
            }
            Address::Range(range) if !range.is_bounded() => {
                let bounded = self.normalize(range)?;
                self.get_range(&Address::Range(bounded))
            }
            Address::Range(range) => {
                if let Some(sheet) = self.sheets.get(range.sheet()) {
                    if let Some((_, formula)) = sheet
                        .array_formulas
                        .iter()
                        .find(|(candidate, _)| candidate == range)
                    {
                        let grid = range.resolve_range()?;
                        let values = grid
                            .iter()
                            .map(|row| row.iter().map(|_| Value::Empty).collect())
                            .collect();
                        return Ok(RangeData::Range {
                            address: range.clone(),
                            values,
                            formulas: RangeFormulas::Array(formula.clone()),
                        });
                    }
                }

                let grid = range.resolve_range()?;
                let sheet = self.sheets.get(range.sheet());
                let mut values = Vec::with_capacity(grid.len());
                let mut formulas = Vec::with_capacity(grid.len());
                for row in &grid {
                    let mut value_row = Vec::with_capacity(row.len());
                    let mut formula_row = Vec::with_capacity(row.len());
                    for member in row {
                        let seed =
                            sheet.and_then(|s| s.cells.get(&(member.row(), member.col())));
                        value_row.push(seed.map(|s| s.value.clone()).unwrap_or(Value::Empty));
                        formula_row.push(seed.and_then(|s| s.formula.clone()));
                    }
                    values.push(value_row);
                    formulas.push(formula_row);
                }
                Ok(RangeData::Range {
                    address: range.clone(),
                    values,
                    formulas: RangeFormulas::PerCell(formulas),
                })
            }
        }
    }

    fn active_sheet(&self) -> Option<String> {
        Some(self.active.clone())
    }
}

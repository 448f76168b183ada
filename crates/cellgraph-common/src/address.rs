//! Canonical cell and range identity.
//!
//! An address is the engine's only notion of node identity: two addresses are
//! equal iff their canonical forms match. Cells are sheet-qualified 1-based
//! (row, col) pairs; ranges are inclusive bounding boxes. Whole-row and
//! whole-column forms (`A:B`, `3:7`) are representable but unbounded, and
//! must be normalized by a data source before they can be resolved into
//! member cells.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid address: '{0}'")]
    Parse(String),
    #[error("cannot resolve unbounded range: '{0}'")]
    Unbounded(String),
}

static SHEET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:'([^']+)'|([^'!:]+))!(.+)$").unwrap());
static CELL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$?([A-Za-z]{1,3})\$?([1-9][0-9]*)$").unwrap());
static COL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\$?([A-Za-z]{1,3})$").unwrap());
static ROW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\$?([1-9][0-9]*)$").unwrap());

/// Convert a 1-based column number to letters (1 -> "A", 28 -> "AB").
pub fn col_to_letters(mut col: u32) -> String {
    debug_assert!(col >= 1);
    let mut out = Vec::new();
    while col > 0 {
        let rem = ((col - 1) % 26) as u8;
        out.push(b'A' + rem);
        col = (col - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Convert column letters to a 1-based column number ("A" -> 1, "AB" -> 28).
pub fn letters_to_col(letters: &str) -> u32 {
    letters
        .bytes()
        .fold(0u32, |acc, b| acc * 26 + (b.to_ascii_uppercase() - b'A' + 1) as u32)
}

fn sheet_needs_quoting(sheet: &str) -> bool {
    !sheet
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn format_sheet(sheet: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if sheet.is_empty() {
        Ok(())
    } else if sheet_needs_quoting(sheet) {
        write!(f, "'{sheet}'!")
    } else {
        write!(f, "{sheet}!")
    }
}

/// A single sheet-qualified cell. Sheet may be empty for an unqualified
/// address; the engine qualifies against the active sheet before use.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellAddress {
    sheet: String,
    row: u32,
    col: u32,
}

impl CellAddress {
    pub fn new(sheet: impl Into<String>, row: u32, col: u32) -> Result<Self, AddressError> {
        if row == 0 || col == 0 {
            return Err(AddressError::Parse(format!("R{row}C{col}")));
        }
        Ok(Self {
            sheet: sheet.into(),
            row,
            col,
        })
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    pub fn col(&self) -> u32 {
        self.col
    }

    pub fn has_sheet(&self) -> bool {
        !self.sheet.is_empty()
    }

    /// Return the same coordinate on `sheet` if this address is unqualified.
    pub fn with_sheet(&self, sheet: &str) -> Self {
        if self.has_sheet() {
            self.clone()
        } else {
            Self {
                sheet: sheet.to_string(),
                ..self.clone()
            }
        }
    }

    /// Coordinate part without the sheet qualifier ("A1").
    pub fn coordinate(&self) -> String {
        format!("{}{}", col_to_letters(self.col), self.row)
    }

    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Deterministic ordering key: (sheet, row, column).
    pub fn sort_key(&self) -> (String, u32, u32) {
        (self.sheet.to_ascii_lowercase(), self.row, self.col)
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_sheet(&self.sheet, f)?;
        write!(f, "{}{}", col_to_letters(self.col), self.row)
    }
}

/// An inclusive rectangular block. A bound of 0 marks an unbounded axis:
/// whole-column ranges have rows (0, 0), whole-row ranges have cols (0, 0).
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeAddress {
    sheet: String,
    start_row: u32,
    start_col: u32,
    end_row: u32,
    end_col: u32,
}

impl RangeAddress {
    pub fn new(
        sheet: impl Into<String>,
        start_row: u32,
        start_col: u32,
        end_row: u32,
        end_col: u32,
    ) -> Result<Self, AddressError> {
        if start_row > end_row || start_col > end_col {
            return Err(AddressError::Parse(format!(
                "R{start_row}C{start_col}:R{end_row}C{end_col}"
            )));
        }
        Ok(Self {
            sheet: sheet.into(),
            start_row,
            start_col,
            end_row,
            end_col,
        })
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    pub fn has_sheet(&self) -> bool {
        !self.sheet.is_empty()
    }

    pub fn with_sheet(&self, sheet: &str) -> Self {
        if self.has_sheet() {
            self.clone()
        } else {
            Self {
                sheet: sheet.to_string(),
                ..self.clone()
            }
        }
    }

    pub fn bounds(&self) -> (u32, u32, u32, u32) {
        (self.start_row, self.start_col, self.end_row, self.end_col)
    }

    /// Both axes bounded, so the member grid is resolvable.
    pub fn is_bounded(&self) -> bool {
        self.start_row >= 1 && self.start_col >= 1
    }

    /// Declared shape in (rows, cols). Unbounded axes report 0.
    pub fn size(&self) -> (usize, usize) {
        if !self.is_bounded() {
            return (0, 0);
        }
        (
            (self.end_row - self.start_row + 1) as usize,
            (self.end_col - self.start_col + 1) as usize,
        )
    }

    /// Row-major grid of member cell addresses.
    pub fn resolve_range(&self) -> Result<Vec<Vec<CellAddress>>, AddressError> {
        if !self.is_bounded() {
            return Err(AddressError::Unbounded(self.to_string()));
        }
        let mut rows = Vec::with_capacity((self.end_row - self.start_row + 1) as usize);
        for r in self.start_row..=self.end_row {
            let mut row = Vec::with_capacity((self.end_col - self.start_col + 1) as usize);
            for c in self.start_col..=self.end_col {
                row.push(CellAddress {
                    sheet: self.sheet.clone(),
                    row: r,
                    col: c,
                });
            }
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn canonical(&self) -> String {
        self.to_string()
    }

    pub fn sort_key(&self) -> (String, u32, u32) {
        (
            self.sheet.to_ascii_lowercase(),
            self.start_row,
            self.start_col,
        )
    }
}

impl fmt::Display for RangeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_sheet(&self.sheet, f)?;
        match (self.start_row, self.start_col) {
            (0, _) => write!(
                f,
                "{}:{}",
                col_to_letters(self.start_col.max(1)),
                col_to_letters(self.end_col.max(1))
            ),
            (_, 0) => write!(f, "{}:{}", self.start_row, self.end_row),
            _ => write!(
                f,
                "{}{}:{}{}",
                col_to_letters(self.start_col),
                self.start_row,
                col_to_letters(self.end_col),
                self.end_row
            ),
        }
    }
}

/// Either a single cell or a rectangular range.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Cell(CellAddress),
    Range(RangeAddress),
}

impl Address {
    /// Parse an A1-style reference, with optional (possibly quoted) sheet
    /// qualifier. `$` anchors are discarded; a range whose corners coincide
    /// collapses to a cell, so canonical identity is stable.
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let text = text.trim();
        let (sheet, rest) = match SHEET_RE.captures(text) {
            Some(caps) => {
                let sheet = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                (sheet, caps.get(3).unwrap().as_str())
            }
            None => (String::new(), text),
        };

        match rest.split_once(':') {
            None => Self::parse_cell(&sheet, rest)
                .map(Address::Cell)
                .ok_or_else(|| AddressError::Parse(text.to_string())),
            Some((a, b)) => {
                let range = Self::parse_range(&sheet, a, b)
                    .ok_or_else(|| AddressError::Parse(text.to_string()))?;
                if range.is_bounded()
                    && range.start_row == range.end_row
                    && range.start_col == range.end_col
                {
                    Ok(Address::Cell(CellAddress {
                        sheet: range.sheet,
                        row: range.start_row,
                        col: range.start_col,
                    }))
                } else {
                    Ok(Address::Range(range))
                }
            }
        }
    }

    fn parse_cell(sheet: &str, text: &str) -> Option<CellAddress> {
        let caps = CELL_RE.captures(text)?;
        Some(CellAddress {
            sheet: sheet.to_string(),
            row: caps.get(2)?.as_str().parse().ok()?,
            col: letters_to_col(caps.get(1)?.as_str()),
        })
    }

    fn parse_range(sheet: &str, a: &str, b: &str) -> Option<RangeAddress> {
        if let (Some(ca), Some(cb)) = (Self::parse_cell(sheet, a), Self::parse_cell(sheet, b)) {
            return Some(RangeAddress {
                sheet: sheet.to_string(),
                start_row: ca.row.min(cb.row),
                start_col: ca.col.min(cb.col),
                end_row: ca.row.max(cb.row),
                end_col: ca.col.max(cb.col),
            });
        }
        if let (Some(ma), Some(mb)) = (COL_RE.captures(a), COL_RE.captures(b)) {
            let ca = letters_to_col(ma.get(1)?.as_str());
            let cb = letters_to_col(mb.get(1)?.as_str());
            return Some(RangeAddress {
                sheet: sheet.to_string(),
                start_row: 0,
                start_col: ca.min(cb),
                end_row: 0,
                end_col: ca.max(cb),
            });
        }
        if let (Some(ma), Some(mb)) = (ROW_RE.captures(a), ROW_RE.captures(b)) {
            let ra: u32 = ma.get(1)?.as_str().parse().ok()?;
            let rb: u32 = mb.get(1)?.as_str().parse().ok()?;
            return Some(RangeAddress {
                sheet: sheet.to_string(),
                start_row: ra.min(rb),
                start_col: 0,
                end_row: ra.max(rb),
                end_col: 0,
            });
        }
        None
    }

    pub fn is_range(&self) -> bool {
        matches!(self, Address::Range(_))
    }

    pub fn sheet(&self) -> &str {
        match self {
            Address::Cell(c) => c.sheet(),
            Address::Range(r) => r.sheet(),
        }
    }

    pub fn has_sheet(&self) -> bool {
        !self.sheet().is_empty()
    }

    pub fn with_sheet(&self, sheet: &str) -> Self {
        match self {
            Address::Cell(c) => Address::Cell(c.with_sheet(sheet)),
            Address::Range(r) => Address::Range(r.with_sheet(sheet)),
        }
    }

    pub fn canonical(&self) -> String {
        self.to_string()
    }

    pub fn sort_key(&self) -> (String, u32, u32) {
        match self {
            Address::Cell(c) => c.sort_key(),
            Address::Range(r) => r.sort_key(),
        }
    }

    pub fn as_cell(&self) -> Option<&CellAddress> {
        match self {
            Address::Cell(c) => Some(c),
            Address::Range(_) => None,
        }
    }

    pub fn as_range(&self) -> Option<&RangeAddress> {
        match self {
            Address::Range(r) => Some(r),
            Address::Cell(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Cell(c) => c.fmt(f),
            Address::Range(r) => r.fmt(f),
        }
    }
}

impl From<CellAddress> for Address {
    fn from(c: CellAddress) -> Self {
        Address::Cell(c)
    }
}

impl From<RangeAddress> for Address {
    fn from(r: RangeAddress) -> Self {
        Address::Range(r)
    }
}

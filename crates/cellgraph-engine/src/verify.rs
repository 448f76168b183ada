//! Bulk verification: recompute formula cells and compare against their
//! previously recorded values. A debugging aid; individual failures are
//! classified and collected, never fatal.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use cellgraph_common::{Address, EngineError, FormulaError, Value};

use crate::compiler::Compiler;
use crate::node::Node;

/// Relative tolerance for numeric comparison.
const REL_TOLERANCE: f64 = 1e-6;
/// Absolute floor so values near zero do not fail on noise.
const ABS_TOLERANCE: f64 = 1e-9;

/// Numeric values compare within tolerance, everything else exactly.
pub fn close_enough(a: &Value, b: &Value) -> bool {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => {
            let diff = (x - y).abs();
            diff <= ABS_TOLERANCE || diff <= REL_TOLERANCE * x.abs().max(y.abs())
        }
        _ => a == b,
    }
}

/// A cell whose recomputed value differs from its recorded one.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub original: Value,
    pub calced: Value,
    pub formula: String,
}

/// A cell whose evaluation failed outright.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedCell {
    pub address: String,
    pub formula: Option<String>,
    pub detail: String,
}

/// Classified outcome of a verification sweep.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Keyed by cell address.
    pub mismatches: BTreeMap<String, Mismatch>,
    /// Keyed by the unimplemented function's (uppercased) name.
    pub not_implemented: BTreeMap<String, Vec<FailedCell>>,
    /// Keyed by the error's display text.
    pub exceptions: BTreeMap<String, Vec<FailedCell>>,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.mismatches.is_empty()
            && self.not_implemented.is_empty()
            && self.exceptions.is_empty()
    }
}

impl Compiler {
    /// Re-evaluate formula cells and compare with their recorded values.
    ///
    /// `outputs` selects the starting set (default: every known formula
    /// cell); with `verify_tree` the sweep follows precedents from each
    /// verified cell. Failures are classified into the report and the sweep
    /// continues.
    pub fn validate_calcs(
        &mut self,
        outputs: Option<&[&str]>,
        verify_tree: bool,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();
        let mut to_verify: Vec<String> = match outputs {
            Some(list) => list.iter().rev().map(|a| (*a).to_string()).collect(),
            None => self
                .formula_cells(None)
                .iter()
                .rev()
                .map(Address::canonical)
                .collect(),
        };

        let mut verified: FxHashSet<String> = FxHashSet::default();
        while let Some(address) = to_verify.pop() {
            if verified.contains(&address) {
                continue;
            }
            match self.verify_one(&address, verify_tree, &mut to_verify, &mut report) {
                Ok(canonical) => {
                    verified.insert(canonical);
                }
                Err(err) => {
                    let formula = self.formula_text(&address);
                    let cell = FailedCell {
                        address: address.clone(),
                        formula,
                        detail: err.to_string(),
                    };
                    match err {
                        EngineError::Formula(FormulaError::NotImplemented { function }) => {
                            report
                                .not_implemented
                                .entry(function.to_ascii_uppercase())
                                .or_default()
                                .push(cell);
                        }
                        other => {
                            report
                                .exceptions
                                .entry(other.to_string())
                                .or_default()
                                .push(cell);
                        }
                    }
                    verified.insert(address);
                }
            }
        }
        report
    }

    fn verify_one(
        &mut self,
        address: &str,
        verify_tree: bool,
        to_verify: &mut Vec<String>,
        report: &mut ValidationReport,
    ) -> Result<String, EngineError> {
        let addr = self.qualify(Address::parse(address)?)?;
        let canonical = addr.canonical();
        if !self.contains_address(&canonical) {
            self.gen_graph(addr, false)?;
        }
        let id = self
            .graph
            .id_of(&canonical)
            .ok_or_else(|| EngineError::UnknownAddress(canonical.clone()))?;

        if let Node::Cell(cell) = self.graph.node(id) {
            if let Some(f) = cell.formula.clone() {
                let original = cell.value.clone();
                // a recorded value equal to the formula text means the
                // workbook stored no computed result for this cell
                if original == Some(Value::Text(f.text.clone())) {
                    debug!(address = %canonical, "no original data");
                } else {
                    self.graph.node_mut(id).clear_value();
                    let calced = self.evaluate_cell(&canonical)?;
                    if let Some(original) = original {
                        if !close_enough(&original, &calced) {
                            warn!(
                                address = %canonical,
                                original = %original,
                                calced = %calced,
                                "verification mismatch"
                            );
                            report.mismatches.insert(
                                canonical.clone(),
                                Mismatch {
                                    original,
                                    calced,
                                    formula: f.text.clone(),
                                },
                            );
                        }
                    }
                }
            }
        }

        if verify_tree {
            for precedent in self.graph.node(id).needed_addresses() {
                to_verify.push(precedent.canonical());
            }
        }
        Ok(canonical)
    }
}

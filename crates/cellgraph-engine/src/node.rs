//! Graph node model: cells and ranges.

use std::sync::Arc;

use cellgraph_common::{Address, CellAddress, RangeAddress, Value};

use crate::formula::CompiledExpr;

/// A compiled formula held by a node: the source text (always starting with
/// `=`) plus the executable handle compiled from it.
#[derive(Clone)]
pub struct Formula {
    pub text: String,
    pub expr: Arc<dyn CompiledExpr>,
}

impl std::fmt::Debug for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Formula").field("text", &self.text).finish()
    }
}

/// A single cell. The address is usually `Address::Cell`; synthetic redirect
/// nodes created for normalized range requests keep the originally requested
/// range address so lookups by that address still resolve.
#[derive(Debug, Clone)]
pub struct CellNode {
    pub address: Address,
    pub value: Option<Value>,
    pub formula: Option<Formula>,
    /// Circular-reference convergence counter; reset by top-level evaluation.
    pub iterations: u32,
    /// Stable per-graph identity, diagnostics and ordering only.
    pub id: u32,
}

/// A rectangular block: a plain aggregate over materialized member cells, or
/// a single array formula covering the whole block (no members then).
#[derive(Debug, Clone)]
pub struct RangeNode {
    pub address: RangeAddress,
    pub value: Option<Value>,
    pub formula: Option<Formula>,
    /// Row-major member grid, resolved from the address.
    pub addresses: Vec<Vec<CellAddress>>,
    /// Declared shape, (rows, cols).
    pub size: (usize, usize),
    pub iterations: u32,
}

#[derive(Debug, Clone)]
pub enum Node {
    Cell(CellNode),
    Range(RangeNode),
}

impl Node {
    pub fn address(&self) -> Address {
        match self {
            Node::Cell(c) => c.address.clone(),
            Node::Range(r) => Address::Range(r.address.clone()),
        }
    }

    pub fn canonical(&self) -> String {
        match self {
            Node::Cell(c) => c.address.canonical(),
            Node::Range(r) => r.address.canonical(),
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(self, Node::Range(_))
    }

    /// Only cells persist to the text snapshot form.
    pub fn serialize(&self) -> bool {
        matches!(self, Node::Cell(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Node::Cell(c) => c.value.as_ref(),
            Node::Range(r) => r.value.as_ref(),
        }
    }

    pub fn set_value(&mut self, value: Value) {
        match self {
            Node::Cell(c) => c.value = Some(value),
            Node::Range(r) => r.value = Some(value),
        }
    }

    pub fn clear_value(&mut self) {
        match self {
            Node::Cell(c) => c.value = None,
            Node::Range(r) => r.value = None,
        }
    }

    pub fn formula(&self) -> Option<&Formula> {
        match self {
            Node::Cell(c) => c.formula.as_ref(),
            Node::Range(r) => r.formula.as_ref(),
        }
    }

    /// Freeze a node to its literal value (the trimmer's leaf conversion).
    pub fn drop_formula(&mut self) {
        match self {
            Node::Cell(c) => c.formula = None,
            Node::Range(r) => r.formula = None,
        }
    }

    pub fn iterations(&self) -> u32 {
        match self {
            Node::Cell(c) => c.iterations,
            Node::Range(r) => r.iterations,
        }
    }

    pub fn bump_iterations(&mut self) {
        match self {
            Node::Cell(c) => c.iterations += 1,
            Node::Range(r) => r.iterations += 1,
        }
    }

    pub fn reset_iterations(&mut self) {
        match self {
            Node::Cell(c) => c.iterations = 0,
            Node::Range(r) => r.iterations = 0,
        }
    }

    /// True for nodes that carry precedent edges: ranges always, cells only
    /// when they hold a formula. Plain data cells have no needs.
    pub fn has_precedents(&self) -> bool {
        self.is_range() || self.formula().is_some()
    }

    /// The addresses this node reads: a formula's precedent set, or for a
    /// plain range its member cells.
    pub fn needed_addresses(&self) -> Vec<Address> {
        match self {
            Node::Cell(c) => c
                .formula
                .as_ref()
                .map(|f| f.expr.needed_addresses().to_vec())
                .unwrap_or_default(),
            Node::Range(r) => match &r.formula {
                Some(f) => f.expr.needed_addresses().to_vec(),
                None => r
                    .addresses
                    .iter()
                    .flat_map(|row| row.iter().cloned().map(Address::Cell))
                    .collect(),
            },
        }
    }
}

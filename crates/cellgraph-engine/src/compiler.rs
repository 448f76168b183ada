//! The compiler: lazy graph construction and memoized evaluation.
//!
//! Construction is worklist-driven. `make_cells` materializes nodes for one
//! address; nodes that carry precedents go on `graph_todos`, and
//! `process_graph_todos` drains that list breadth-first, building any
//! late-discovered precedent and wiring precedent -> dependent edges. Ranges
//! discovered along the way queue on `range_todos` and have their aggregate
//! value computed once edges settle, most recently discovered first.
//!
//! Evaluation is demand-driven with per-node caches. Circular references are
//! expected: each formula node carries an iteration counter, and once the
//! configured cap is exceeded the node is seeded with `0` and invoked one
//! final time, which lets cycles converge instead of recursing forever.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{debug, info};

use cellgraph_common::{
    Address, CellError, CellErrorKind, EngineError, Value,
};

use crate::formula::{self, EvalContext, ref_formula};
use crate::graph::{DepGraph, NodeId};
use crate::node::{CellNode, Node, RangeNode};
use crate::source::{DataSource, RangeData, RangeFormulas};

pub struct Compiler {
    pub(crate) source: Option<Box<dyn DataSource>>,
    pub(crate) expr_compiler: Arc<dyn formula::ExprCompiler>,
    pub(crate) graph: DepGraph,
    /// Nodes whose precedent edges are not wired yet.
    pub(crate) graph_todos: Vec<NodeId>,
    /// Ranges whose aggregate value is pending, in discovery order.
    pub(crate) range_todos: Vec<String>,
    pub(crate) excel_hash: Option<String>,
    pub(crate) extra_data: Option<serde_json::Map<String, serde_json::Value>>,
    pub(crate) max_iterations: Option<u32>,
    pub(crate) filename: Option<PathBuf>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("graph_todos", &self.graph_todos)
            .field("range_todos", &self.range_todos)
            .field("excel_hash", &self.excel_hash)
            .field("extra_data", &self.extra_data)
            .field("max_iterations", &self.max_iterations)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

impl Compiler {
    pub fn new(
        source: Box<dyn DataSource>,
        expr_compiler: Arc<dyn formula::ExprCompiler>,
    ) -> Self {
        Self {
            source: Some(source),
            expr_compiler,
            graph: DepGraph::new(),
            graph_todos: Vec::new(),
            range_todos: Vec::new(),
            excel_hash: None,
            extra_data: None,
            max_iterations: None,
            filename: None,
        }
    }

    /// Remember the workbook file this graph was compiled from and capture
    /// its content hash for later integrity checks.
    pub fn with_workbook_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.excel_hash = crate::snapshot::file_sha256(&path);
        self.filename = Some(path);
        self
    }

    /// Cap formula re-invocations per node during circular evaluation.
    pub fn with_max_iterations(mut self, cap: u32) -> Self {
        self.max_iterations = Some(cap);
        self
    }

    pub fn set_max_iterations(&mut self, cap: Option<u32>) {
        self.max_iterations = cap;
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn excel_hash(&self) -> Option<&str> {
        self.excel_hash.as_deref()
    }

    /// Opaque user data preserved across snapshots.
    pub fn extra_data(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.extra_data.as_ref()
    }

    pub fn set_extra_data(&mut self, data: serde_json::Map<String, serde_json::Value>) {
        self.extra_data = Some(data);
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains_address(&self, address: &str) -> bool {
        self.graph.contains(address)
    }

    /// Canonical addresses of every known node, in insertion order.
    pub fn known_addresses(&self) -> Vec<String> {
        self.graph.addresses().collect()
    }

    /// The cached value of a node, if clean.
    pub fn cached_value(&self, address: &str) -> Option<Value> {
        self.graph
            .id_of(address)
            .and_then(|id| self.graph.node(id).value().cloned())
    }

    /// The formula text of a node, if it carries one.
    pub fn formula_text(&self, address: &str) -> Option<String> {
        self.graph
            .id_of(address)
            .and_then(|id| self.graph.node(id).formula().map(|f| f.text.clone()))
    }

    /* ─────────────────────────── construction ─────────────────────────── */

    /// Guarantee `address` and its full precedent closure exist in the
    /// graph. Idempotent: a known address is a no-op.
    pub fn build(&mut self, address: &str) -> Result<(), EngineError> {
        if self.graph.contains(address) {
            return Ok(());
        }
        let addr = self.qualify(Address::parse(address)?)?;
        self.gen_graph(addr, false)
    }

    /// Resolve a possibly unqualified address against the active sheet.
    pub(crate) fn qualify(&self, addr: Address) -> Result<Address, EngineError> {
        if addr.has_sheet() {
            return Ok(addr);
        }
        match self.source.as_ref().and_then(|s| s.active_sheet()) {
            Some(sheet) => Ok(addr.with_sheet(&sheet)),
            None => Err(EngineError::UnknownAddress(format!(
                "{addr}: missing sheet name and no active sheet"
            ))),
        }
    }

    pub(crate) fn gen_graph(&mut self, seed: Address, recursed: bool) -> Result<(), EngineError> {
        let seed = self.qualify(seed)?;
        if seed.sheet().contains('[') {
            return Err(EngineError::UnsupportedFeature(format!(
                "linked workbook reference: {seed}"
            )));
        }
        if self.graph.contains(&seed.canonical()) {
            return Ok(());
        }
        self.make_cells(&seed)?;
        if !recursed {
            self.process_graph_todos()?;
        }
        Ok(())
    }

    fn make_cells(&mut self, address: &Address) -> Result<(), EngineError> {
        debug!(address = %address, "building nodes");
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| EngineError::UnknownAddress(address.canonical()))?;
        let data = source.get_range(address)?;
        let mut new_ids: Vec<NodeId> = Vec::new();

        match data {
            RangeData::Range {
                address: resolved,
                values,
                formulas,
            } => {
                let resolved_addr = Address::Range(resolved.clone());
                if resolved_addr != *address {
                    // The source normalized the request; plant a redirect
                    // under the requested address so later lookups by it
                    // still resolve.
                    let f = formula::compile(
                        &*self.expr_compiler,
                        &ref_formula(&resolved_addr),
                        address,
                    )?;
                    let cid = self.graph.next_cell_id();
                    new_ids.push(self.graph.insert(Node::Cell(CellNode {
                        address: address.clone(),
                        value: None,
                        formula: Some(f),
                        iterations: 0,
                        id: cid,
                    })));
                }

                self.range_todos.push(resolved.canonical());

                if !self.graph.contains(&resolved.canonical()) {
                    let addresses = resolved.resolve_range()?;
                    let size = resolved.size();
                    match formulas {
                        RangeFormulas::Array(text) => {
                            let f = formula::compile(&*self.expr_compiler, &text, &resolved_addr)?;
                            new_ids.push(self.graph.insert(Node::Range(RangeNode {
                                address: resolved,
                                value: None,
                                formula: Some(f),
                                addresses,
                                size,
                                iterations: 0,
                            })));
                        }
                        RangeFormulas::PerCell(fgrid) => {
                            new_ids.push(self.graph.insert(Node::Range(RangeNode {
                                address: resolved,
                                value: None,
                                formula: None,
                                addresses: addresses.clone(),
                                size,
                                iterations: 0,
                            })));
                            for (r, row) in addresses.iter().enumerate() {
                                for (c, member) in row.iter().enumerate() {
                                    if self.graph.contains(&member.canonical()) {
                                        continue;
                                    }
                                    let value = values
                                        .get(r)
                                        .and_then(|vr| vr.get(c))
                                        .cloned()
                                        .unwrap_or(Value::Empty);
                                    let ftext = fgrid
                                        .get(r)
                                        .and_then(|fr| fr.get(c))
                                        .cloned()
                                        .flatten()
                                        .filter(|t| !t.is_empty());
                                    let member_addr = Address::Cell(member.clone());
                                    let f = match ftext {
                                        Some(t) => Some(formula::compile(
                                            &*self.expr_compiler,
                                            &t,
                                            &member_addr,
                                        )?),
                                        None => None,
                                    };
                                    let cid = self.graph.next_cell_id();
                                    new_ids.push(self.graph.insert(Node::Cell(CellNode {
                                        address: member_addr,
                                        value: match value {
                                            Value::Empty => None,
                                            v => Some(v),
                                        },
                                        formula: f,
                                        iterations: 0,
                                        id: cid,
                                    })));
                                }
                            }
                        }
                        RangeFormulas::None => {
                            new_ids.push(self.graph.insert(Node::Range(RangeNode {
                                address: resolved,
                                value: None,
                                formula: None,
                                addresses: addresses.clone(),
                                size,
                                iterations: 0,
                            })));
                            for member in addresses.into_iter().flatten() {
                                if !self.graph.contains(&member.canonical()) {
                                    self.make_cells(&Address::Cell(member))?;
                                }
                            }
                        }
                    }
                }
            }
            RangeData::Cell {
                address: cell_addr,
                value,
                formula,
            } => {
                let node_addr = Address::Cell(cell_addr);
                let f = match formula.filter(|t| !t.is_empty()) {
                    Some(t) => Some(formula::compile(&*self.expr_compiler, &t, &node_addr)?),
                    None => None,
                };
                let cid = self.graph.next_cell_id();
                new_ids.push(self.graph.insert(Node::Cell(CellNode {
                    address: node_addr,
                    value: match value {
                        Value::Empty => None,
                        v => Some(v),
                    },
                    formula: f,
                    iterations: 0,
                    id: cid,
                })));
            }
        }

        for id in new_ids {
            if self.graph.node(id).has_precedents() {
                self.graph_todos.push(id);
            }
        }
        Ok(())
    }

    /// Drain the pending-edges worklist, then compute queued range
    /// aggregates in reverse discovery order.
    pub(crate) fn process_graph_todos(&mut self) -> Result<(), EngineError> {
        while let Some(dependent) = self.graph_todos.pop() {
            debug!(address = %self.graph.node(dependent).canonical(), "wiring precedents");
            for precedent in self.graph.node(dependent).needed_addresses() {
                let precedent = self.qualify(precedent)?;
                let key = precedent.canonical();
                if !self.graph.contains(&key) {
                    self.gen_graph(precedent, true)?;
                }
                let pid = self
                    .graph
                    .id_of(&key)
                    .ok_or_else(|| EngineError::UnknownAddress(key.clone()))?;
                self.graph.add_edge(pid, dependent);
            }
        }

        let todos = std::mem::take(&mut self.range_todos);
        for address in todos.iter().rev() {
            self.evaluate_range_internal(address)?;
        }

        info!(
            nodes = self.graph.node_count(),
            edges = self.graph.edge_count(),
            "graph construction done"
        );
        Ok(())
    }

    /* ─────────────────────────── evaluation ───────────────────────────── */

    /// Evaluate one address. Unknown addresses are built on demand;
    /// iteration counters reset before evaluation; grid results with
    /// trailing singleton dimensions collapse.
    pub fn evaluate(&mut self, address: &str) -> Result<Value, EngineError> {
        self.evaluate_with(address, false)
    }

    /// Vectorized form: each element evaluates as a recursive call, so
    /// counters are not reset between elements.
    pub fn evaluate_many(&mut self, addresses: &[&str]) -> Result<Vec<Value>, EngineError> {
        addresses
            .iter()
            .map(|a| self.evaluate_with(a, true))
            .collect()
    }

    fn evaluate_with(&mut self, address: &str, recursed: bool) -> Result<Value, EngineError> {
        let canonical = if self.graph.contains(address) {
            address.to_string()
        } else {
            let addr = self.qualify(Address::parse(address)?)?;
            if !self.graph.contains(&addr.canonical()) {
                self.gen_graph(addr.clone(), false)?;
            }
            addr.canonical()
        };

        if !recursed {
            for id in self.graph.iter_ids().collect::<Vec<_>>() {
                let node = self.graph.node_mut(id);
                if node.is_range() || node.formula().is_some() {
                    node.reset_iterations();
                }
            }
        }

        Ok(self.evaluate_cell(&canonical)?.collapse())
    }

    pub(crate) fn evaluate_cell(&mut self, address: &str) -> Result<Value, EngineError> {
        let id = self
            .graph
            .id_of(address)
            .ok_or_else(|| EngineError::UnknownAddress(address.to_string()))?;

        enum Pending {
            Range,
            FormulaCell { over_cap: bool },
            Plain,
        }

        if self.graph.node(id).value().is_none() {
            let pending = match self.graph.node(id) {
                Node::Range(_) => Pending::Range,
                Node::Cell(cell) if cell.formula.is_some() => Pending::FormulaCell {
                    over_cap: self
                        .max_iterations
                        .is_some_and(|cap| cell.iterations > cap),
                },
                _ => Pending::Plain,
            };
            match pending {
                Pending::Range => {
                    self.evaluate_range_internal(address)?;
                }
                Pending::FormulaCell { over_cap } => {
                    if over_cap {
                        // Divergence guard: seed the cycle with 0. The
                        // formula still runs once more below; recursive
                        // self-references observe the seed and terminate.
                        self.graph.node_mut(id).set_value(Value::Int(0));
                    } else {
                        self.graph.node_mut(id).bump_iterations();
                    }
                    let f = self.graph.node(id).formula().cloned().expect("formula");
                    debug!(address, formula = %f.text, "evaluating cell");
                    let value = f.expr.invoke(&mut EngineContext {
                        compiler: &mut *self,
                    })?;
                    // a grid where a scalar was expected is an error value
                    let value = if value.is_array() {
                        Value::Error(CellError::new(CellErrorKind::Value))
                    } else {
                        value
                    };
                    info!(address, value = %value, "cell evaluated");
                    self.graph.node_mut(id).set_value(value);
                }
                Pending::Plain => {}
            }
        }

        let value = self
            .graph
            .node(id)
            .value()
            .cloned()
            .unwrap_or(Value::Empty);
        if let Value::Ref(target) = value {
            // reference results dereference on every read
            return self.evaluate_cell(&target.canonical());
        }
        Ok(value)
    }

    pub(crate) fn evaluate_range_internal(&mut self, address: &str) -> Result<Value, EngineError> {
        if self.graph.id_of(address).is_none() {
            // range nodes are not persisted in the text form; rebuild
            let addr = Address::parse(address)?;
            if !addr.has_sheet() {
                return Err(EngineError::UnknownAddress(format!(
                    "{address}: missing sheet name"
                )));
            }
            self.gen_graph(addr, false)?;
        }
        let id = self
            .graph
            .id_of(address)
            .ok_or_else(|| EngineError::UnknownAddress(address.to_string()))?;

        if !self.graph.node(id).is_range() {
            // a degenerate range collapsed to a single cell
            return self.evaluate_cell(address);
        }

        if let Some(v) = self.graph.node(id).value() {
            return Ok(v.clone());
        }

        let value = match self.graph.node(id).formula().cloned() {
            None => {
                let grid = match self.graph.node(id) {
                    Node::Range(range) => range.addresses.clone(),
                    Node::Cell(_) => unreachable!("checked above"),
                };
                let mut rows = Vec::with_capacity(grid.len());
                for row in grid {
                    let mut out = Vec::with_capacity(row.len());
                    for member in row {
                        out.push(self.evaluate_cell(&member.canonical())?);
                    }
                    rows.push(out);
                }
                Value::Array(rows)
            }
            Some(f) => {
                debug!(address, formula = %f.text, "evaluating array formula");
                // cached verbatim, whatever shape the formula produced
                f.expr.invoke(&mut EngineContext {
                    compiler: &mut *self,
                })?
            }
        };

        info!(address, value = %value, "range evaluated");
        self.graph.node_mut(id).set_value(value.clone());
        Ok(value)
    }

    /// Eager, total re-evaluation: clear every formula-bearing cell and
    /// every range, then recompute all of them.
    pub fn recalculate(&mut self) -> Result<(), EngineError> {
        for id in self.graph.iter_ids().collect::<Vec<_>>() {
            let node = self.graph.node_mut(id);
            if node.is_range() || node.formula().is_some() {
                node.clear_value();
                node.reset_iterations();
            }
        }

        let ranges: Vec<String> = self
            .graph
            .iter_ids()
            .filter(|id| self.graph.node(*id).is_range())
            .map(|id| self.graph.node(id).canonical())
            .collect();
        for address in ranges {
            self.evaluate_range_internal(&address)?;
        }

        let cells: Vec<String> = self
            .graph
            .iter_ids()
            .filter(|id| !self.graph.node(*id).is_range())
            .map(|id| self.graph.node(id).canonical())
            .collect();
        for address in cells {
            self.evaluate_cell(&address)?;
        }
        Ok(())
    }

    /* ───────────────────────────── mutation ───────────────────────────── */

    /// Set one cell's literal value, invalidating its transitive dependents
    /// when the value actually changes.
    pub fn set_value(
        &mut self,
        address: &str,
        value: impl Into<Value>,
    ) -> Result<(), EngineError> {
        self.set_value_with(address, value.into(), false)
    }

    /// Set values for a parallel slice of cell addresses. Array values are
    /// flattened first; the flattened count must match the address count.
    pub fn set_values(&mut self, addresses: &[&str], values: &[Value]) -> Result<(), EngineError> {
        let flat: Vec<Value> = values.iter().flat_map(|v| v.flatten()).collect();
        if addresses.len() != flat.len() {
            return Err(EngineError::ShapeMismatch(format!(
                "{} addresses vs {} values",
                addresses.len(),
                flat.len()
            )));
        }
        for (address, value) in addresses.iter().zip(flat) {
            self.set_value_with(address, value, false)?;
        }
        Ok(())
    }

    /// Full assignment entry point. With `set_as_range` false an array value
    /// distributes element-for-element over the target's member cells; with
    /// it true the array is assigned whole to the (range) node.
    pub fn set_value_with(
        &mut self,
        address: &str,
        value: Value,
        set_as_range: bool,
    ) -> Result<(), EngineError> {
        if value.is_array() && !set_as_range {
            let addr = self.qualify(Address::parse(address)?)?;
            let flat = value.flatten();
            if let Address::Range(r) = &addr {
                let targets: Vec<_> = r.resolve_range()?.into_iter().flatten().collect();
                if targets.len() != flat.len() {
                    return Err(EngineError::ShapeMismatch(format!(
                        "{} member cells vs {} values for {addr}",
                        targets.len(),
                        flat.len()
                    )));
                }
                for (target, v) in targets.into_iter().zip(flat) {
                    self.set_value_with(&target.canonical(), v, false)?;
                }
                return Ok(());
            }
            if flat.len() != 1 {
                return Err(EngineError::ShapeMismatch(format!(
                    "1 cell vs {} values for {addr}",
                    flat.len()
                )));
            }
            return self.set_value_with(&addr.canonical(), flat.into_iter().next().unwrap(), false);
        }

        let canonical = if self.graph.contains(address) {
            address.to_string()
        } else {
            let addr = self.qualify(Address::parse(address)?)?;
            if !self.graph.contains(&addr.canonical()) && self.source.is_some() {
                self.gen_graph(addr.clone(), false)?;
            }
            let key = addr.canonical();
            if !self.graph.contains(&key) {
                return Err(EngineError::UnknownAddress(key));
            }
            key
        };

        let id = self.graph.id_of(&canonical).expect("known node");
        if self.graph.node(id).value() != Some(&value) {
            if self.graph.node(id).value().is_none() {
                // give the cascade a root to clear when setting a dirty cell
                self.graph.node_mut(id).set_value(value.clone());
            }
            self.reset(id);
            self.graph.node_mut(id).set_value(value);
        }
        Ok(())
    }

    /// Invalidation cascade: clear the node, then every transitive
    /// dependent that is not already dirty. Work-stack driven; the walk is
    /// bounded by the dirty frontier.
    fn reset(&mut self, root: NodeId) {
        if self.graph.node(root).value().is_none() {
            return;
        }
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if self.graph.node(id).value().is_none() {
                continue;
            }
            info!(address = %self.graph.node(id).canonical(), "resetting");
            self.graph.node_mut(id).clear_value();
            for dependent in self.graph.dependents(id).to_vec() {
                if self
                    .graph
                    .get(dependent)
                    .is_some_and(|n| n.value().is_some())
                {
                    stack.push(dependent);
                }
            }
        }
    }

    /* ──────────────────────────── diagnostics ─────────────────────────── */

    /// Indented precedent tree: one `address = value` line per node,
    /// children sorted by address, cycles marked instead of followed.
    pub fn value_tree(&self, address: &str) -> Result<Vec<String>, EngineError> {
        enum Frame {
            Enter(NodeId, usize),
            Exit(NodeId),
        }

        let root = self
            .graph
            .id_of(address)
            .ok_or_else(|| EngineError::UnknownAddress(address.to_string()))?;
        let mut lines = Vec::new();
        let mut path: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack = vec![Frame::Enter(root, 0)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id, depth) => {
                    let node = self.graph.node(id);
                    let value = node.value().cloned().unwrap_or(Value::Empty);
                    let indent = " ".repeat(depth);
                    if path.contains(&id) {
                        lines.push(format!("{indent}{} (circular)", node.canonical()));
                        continue;
                    }
                    lines.push(format!("{indent}{} = {value}", node.canonical()));
                    path.insert(id);
                    stack.push(Frame::Exit(id));
                    let mut children: Vec<NodeId> = self.graph.precedents(id).to_vec();
                    children.sort_by_key(|c| self.graph.node(*c).canonical());
                    for child in children.into_iter().rev() {
                        stack.push(Frame::Enter(child, depth + 1));
                    }
                }
                Frame::Exit(id) => {
                    path.remove(&id);
                }
            }
        }
        Ok(lines)
    }

    /// Known formula-bearing cell addresses in insertion order, optionally
    /// restricted to one sheet. Synthetic redirects are skipped.
    pub fn formula_cells(&self, sheet: Option<&str>) -> Vec<Address> {
        self.graph
            .iter_ids()
            .filter_map(|id| match self.graph.node(id) {
                Node::Cell(c) => {
                    let f = c.formula.as_ref()?;
                    if formula::parse_ref_formula(&f.text).is_some() {
                        return None;
                    }
                    if sheet.is_some_and(|s| c.address.sheet() != s) {
                        return None;
                    }
                    Some(c.address.clone())
                }
                _ => None,
            })
            .collect()
    }
}

/// The engine side of the formula seam: evaluation callbacks bound to one
/// compiler for the duration of an invocation.
struct EngineContext<'a> {
    compiler: &'a mut Compiler,
}

impl EvalContext for EngineContext<'_> {
    fn evaluate(&mut self, address: &str) -> Result<Value, EngineError> {
        self.compiler.evaluate_cell(address)
    }

    fn evaluate_range(&mut self, address: &str) -> Result<Value, EngineError> {
        self.compiler.evaluate_range_internal(address)
    }
}

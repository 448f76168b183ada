//! Minimal-subgraph extraction.
//!
//! `trim(inputs, outputs)` prunes the graph in place to the nodes needed to
//! compute the outputs when only the inputs may vary. Two phases: a forward
//! walk over dependent edges from every input collects the reachable set,
//! then a backward walk over the outputs' precedents freezes everything
//! outside that set to its literal value. Both walks are work-stack driven.

use rustc_hash::FxHashSet;
use tracing::{error, info, warn};

use cellgraph_common::{Address, EngineError};

use crate::compiler::Compiler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Warning,
    Error,
}

impl Compiler {
    /// Prune to the minimal subgraph between `inputs` and `outputs`.
    ///
    /// An input with no node or no dependents produces an error diagnostic
    /// (a warning if that input is itself a requested output); any error
    /// diagnostic aborts the whole operation after logging all of them.
    pub fn trim(&mut self, inputs: &[&str], outputs: &[&str]) -> Result<(), EngineError> {
        let inputs: Vec<Address> = inputs
            .iter()
            .map(|a| self.qualify(Address::parse(a)?))
            .collect::<Result<_, _>>()?;
        let outputs: Vec<Address> = outputs
            .iter()
            .map(|a| self.qualify(Address::parse(a)?))
            .collect::<Result<_, _>>()?;

        // 1) build the full graph for every output
        for output in &outputs {
            if !self.contains_address(&output.canonical()) {
                self.gen_graph(output.clone(), true)?;
            }
        }
        self.process_graph_todos()?;

        let output_keys: FxHashSet<String> =
            outputs.iter().map(|o| o.canonical()).collect();

        // 2) forward walk from each input over dependent edges
        let mut needed: FxHashSet<String> = FxHashSet::default();
        let mut diagnostics: Vec<(Severity, String)> = Vec::new();
        for input in &inputs {
            let key = input.canonical();
            let unreferenced = match self.graph.id_of(&key) {
                None => Some(format!("input address {key}: not found in the node map")),
                Some(id) if self.graph.dependents(id).is_empty() => {
                    Some(format!("input address {key}: no outputs depend on it"))
                }
                Some(id) => {
                    let mut stack = vec![id];
                    while let Some(node) = stack.pop() {
                        for dependent in self.graph.dependents(node).to_vec() {
                            let dkey = self.graph.node(dependent).canonical();
                            if needed.insert(dkey) {
                                stack.push(dependent);
                            }
                        }
                    }
                    None
                }
            };
            if let Some(message) = unreferenced {
                let severity = if output_keys.contains(&key) {
                    Severity::Warning
                } else {
                    Severity::Error
                };
                diagnostics.push((severity, message));
            }
        }

        if !diagnostics.is_empty() {
            for (severity, message) in &diagnostics {
                match severity {
                    Severity::Warning => warn!("{message}"),
                    Severity::Error => error!("{message}"),
                }
            }
            if diagnostics.iter().any(|(s, _)| *s == Severity::Error) {
                let mut messages: Vec<&str> =
                    diagnostics.iter().map(|(_, m)| m.as_str()).collect();
                messages.sort_unstable();
                return Err(EngineError::Trim(messages.join("\n")));
            }
        }

        // 3) outputs survive even with no dependents
        for key in &output_keys {
            needed.insert(key.clone());
        }

        // 4) backward walk over precedents from each output, freezing
        //    anything outside the needed set to its literal value
        let mut processed: FxHashSet<String> = FxHashSet::default();
        let mut stack: Vec<_> = outputs
            .iter()
            .filter_map(|o| self.graph.id_of(&o.canonical()))
            .collect();
        while let Some(node) = stack.pop() {
            for precedent in self.graph.node(node).needed_addresses() {
                let key = precedent.canonical();
                if !processed.insert(key.clone()) {
                    continue;
                }
                let Some(pid) = self.graph.id_of(&key) else {
                    continue;
                };
                if needed.contains(&key) || precedent.is_range() {
                    // ranges stay: a surviving formula may read them whole
                    needed.insert(key);
                    stack.push(pid);
                } else {
                    needed.insert(key.clone());
                    self.graph.node_mut(pid).drop_formula();
                    info!(address = %key, "trimmed to literal");
                }
            }
        }

        // 5) flag buried (non-leaf) inputs
        for input in &inputs {
            let key = input.canonical();
            if let Some(id) = self.graph.id_of(&key) {
                if self.graph.node(id).formula().is_some() {
                    info!(address = %key, "input is not a leaf node");
                }
            }
        }

        // 6) drop everything outside the needed set
        let to_remove: Vec<String> = self
            .graph
            .addresses()
            .filter(|addr| !needed.contains(addr))
            .collect();
        for address in &to_remove {
            self.graph.remove(address);
        }
        self.graph.scrub_edges();
        info!(
            removed = to_remove.len(),
            surviving = self.graph.node_count(),
            "graph trimmed"
        );
        Ok(())
    }
}

//! Persistence: text and binary snapshots.
//!
//! The text form (`yml`/`yaml`/`json`) is human-diffable: reserved keys
//! `excel_hash` and `cell_map` (one entry per serializable cell, ordered by
//! address sort key, each a literal or a `=`-prefixed formula), plus any
//! user keys carried through opaquely. The binary form (`bin`, bincode) is a
//! direct capture of the node map and metadata; transient state (data
//! source, work queues) is reinitialized on load.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use cellgraph_common::{Address, CellErrorKind, CellError, EngineError, Value};

use crate::compiler::Compiler;
use crate::formula::{self, ExprCompiler};
use crate::graph::DepGraph;
use crate::node::{CellNode, Node, RangeNode};
use crate::source::{ReplayEntry, ReplaySource};

/// Supported snapshot extensions, in load-probe priority order.
pub const SAVE_FILE_EXTENSIONS: [&str; 4] = ["bin", "yml", "yaml", "json"];

const BINARY_FORMAT_VERSION: u32 = 1;

/// Hex-encoded SHA-256 of a file's contents, `None` if unreadable.
pub(crate) fn file_sha256(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(hex::encode(hasher.finalize()))
}

fn ends_with_ext(name: &str, ext: &str) -> bool {
    name.ends_with(&format!(".{ext}"))
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::from(s.clone()),
        Value::Bool(b) => serde_json::Value::from(*b),
        Value::Empty => serde_json::Value::Null,
        Value::Error(e) => serde_json::Value::from(e.to_string()),
        Value::Ref(a) => serde_json::Value::from(formula::ref_formula(a)),
        Value::Array(rows) => serde_json::Value::Array(
            rows.iter()
                .map(|row| serde_json::Value::Array(row.iter().map(value_to_json).collect()))
                .collect(),
        ),
    }
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Empty,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => match CellErrorKind::parse(s) {
            Some(kind) => Value::Error(CellError::new(kind)),
            None => Value::Text(s.clone()),
        },
        serde_json::Value::Array(rows) => Value::Array(
            rows.iter()
                .map(|row| match row {
                    serde_json::Value::Array(cells) => cells.iter().map(json_to_value).collect(),
                    other => vec![json_to_value(other)],
                })
                .collect(),
        ),
        serde_json::Value::Object(_) => Value::Empty,
    }
}

#[derive(Serialize, Deserialize)]
enum NodeRecordKind {
    Cell { id: u32 },
    Range,
}

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    address: String,
    kind: NodeRecordKind,
    value: Option<Value>,
    formula: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct BinarySnapshot {
    version: u32,
    excel_hash: Option<String>,
    /// User data as JSON text; bincode cannot carry free-form JSON values.
    extra_data: Option<String>,
    max_iterations: Option<u32>,
    filename: Option<PathBuf>,
    nodes: Vec<NodeRecord>,
}

impl Compiler {
    /// Does the original workbook file still hash to what it did when this
    /// graph was compiled?
    pub fn hash_matches(&self) -> bool {
        let current = self.filename.as_deref().and_then(file_sha256);
        self.excel_hash == current
    }

    /// Save to the requested snapshot kinds, at most one binary-like and
    /// one text-like per call.
    ///
    /// `filename` defaults to the compiled workbook path; an explicit name
    /// carrying a recognized extension pins the kind and overrides
    /// `file_types`. The text artifact is always produced when requested;
    /// the binary is only (re)written when the text content hash changed or
    /// no binary exists yet.
    pub fn to_file(
        &self,
        filename: Option<&Path>,
        file_types: &[&str],
    ) -> Result<(), EngineError> {
        let filename: PathBuf = match filename {
            Some(p) => p.to_path_buf(),
            None => self
                .filename
                .clone()
                .ok_or_else(|| EngineError::Snapshot("no filename to save to".into()))?,
        };
        let fname = filename.to_string_lossy().into_owned();

        let pinned = SAVE_FILE_EXTENSIONS
            .iter()
            .find(|e| ends_with_ext(&fname, e))
            .copied();
        let file_types: Vec<&str> = match pinned {
            Some(ext) => vec![ext],
            None => file_types.to_vec(),
        };

        let unknown: Vec<&str> = file_types
            .iter()
            .copied()
            .filter(|t| !SAVE_FILE_EXTENSIONS.contains(t))
            .collect();
        if !unknown.is_empty() {
            return Err(EngineError::UnrecognizedFileKind(unknown.join(" ")));
        }

        let binary_kinds: Vec<&str> = file_types.iter().copied().filter(|t| *t == "bin").collect();
        let text_kinds: Vec<&str> = file_types.iter().copied().filter(|t| *t != "bin").collect();
        if binary_kinds.len() > 1 || text_kinds.len() > 1 {
            return Err(EngineError::AmbiguousFileKind(format!(
                "only one binary and one text kind allowed, got: {}",
                file_types.join(" ")
            )));
        }
        let text_kind = text_kinds.first().copied();
        let is_json = text_kind == Some("json");

        // round trip through the text form to strip transient junk
        let text_ext = text_kind.unwrap_or("yml");
        let text_name = if ends_with_ext(&fname, text_ext) {
            filename.clone()
        } else {
            PathBuf::from(format!("{fname}.{text_ext}"))
        };
        let text_changed = self.to_text(&text_name, is_json)?;

        if !binary_kinds.is_empty() {
            let bin_name = if ends_with_ext(&fname, "bin") {
                filename.clone()
            } else {
                PathBuf::from(format!("{fname}.bin"))
            };
            if text_changed || !bin_name.exists() {
                let reloaded =
                    Compiler::from_text(&text_name, is_json, self.expr_compiler.clone())?;
                if text_kind.is_none() {
                    fs::remove_file(&text_name)?;
                }
                reloaded.write_binary(&bin_name)?;
            }
        }
        Ok(())
    }

    /// Load a snapshot saved by [`Compiler::to_file`]. The kind is inferred
    /// from the extension; an extensionless name probes the supported
    /// extensions in priority order.
    pub fn from_file(
        path: &Path,
        expr_compiler: Arc<dyn ExprCompiler>,
    ) -> Result<Compiler, EngineError> {
        let fname = path.to_string_lossy().into_owned();
        let extension = SAVE_FILE_EXTENSIONS
            .iter()
            .find(|e| ends_with_ext(&fname, e))
            .or_else(|| {
                SAVE_FILE_EXTENSIONS
                    .iter()
                    .find(|e| Path::new(&format!("{fname}.{e}")).exists())
            })
            .copied()
            .ok_or_else(|| EngineError::UnrecognizedFileKind(fname.clone()))?;

        let full = if ends_with_ext(&fname, extension) {
            path.to_path_buf()
        } else {
            PathBuf::from(format!("{fname}.{extension}"))
        };

        match extension {
            "bin" => Compiler::from_binary(&full, expr_compiler),
            ext => Compiler::from_text(&full, ext == "json", expr_compiler),
        }
    }

    /// Write the text snapshot, returning whether the file content changed
    /// (or the file is new).
    pub(crate) fn to_text(&self, path: &Path, is_json: bool) -> Result<bool, EngineError> {
        let mut doc = serde_json::Map::new();
        if let Some(extra) = &self.extra_data {
            for (key, value) in extra {
                if key != "excel_hash" && key != "cell_map" {
                    doc.insert(key.clone(), value.clone());
                }
            }
        }
        doc.insert(
            "excel_hash".to_string(),
            match &self.excel_hash {
                Some(h) => serde_json::Value::from(h.clone()),
                None => serde_json::Value::Null,
            },
        );

        let mut entries: Vec<(Address, serde_json::Value)> = self
            .graph
            .iter_ids()
            .filter_map(|id| {
                let node = self.graph.node(id);
                if !node.serialize() {
                    return None;
                }
                let cell_value = match node.formula() {
                    Some(f) => serde_json::Value::from(f.text.clone()),
                    None => node
                        .value()
                        .map(value_to_json)
                        .unwrap_or(serde_json::Value::Null),
                };
                Some((node.address(), cell_value))
            })
            .collect();
        entries.sort_by_key(|(addr, _)| addr.sort_key());

        let mut cell_map = serde_json::Map::new();
        for (addr, value) in entries {
            cell_map.insert(addr.canonical(), value);
        }
        doc.insert("cell_map".to_string(), serde_json::Value::Object(cell_map));

        let existing_hash = file_sha256(path);
        let text = if is_json {
            serde_json::to_string_pretty(&doc)
                .map_err(|e| EngineError::Snapshot(e.to_string()))?
        } else {
            serde_yaml::to_string(&serde_json::Value::Object(doc))
                .map_err(|e| EngineError::Snapshot(e.to_string()))?
        };
        fs::write(path, text)?;

        Ok(existing_hash.is_none() || existing_hash != file_sha256(path))
    }

    /// Rebuild a compiler from a text snapshot by replaying every stored
    /// address through the builder, cells first, then ranges.
    pub(crate) fn from_text(
        path: &Path,
        is_json: bool,
        expr_compiler: Arc<dyn ExprCompiler>,
    ) -> Result<Compiler, EngineError> {
        let text = fs::read_to_string(path)?;
        let doc: serde_json::Value = if is_json {
            serde_json::from_str(&text).map_err(|e| EngineError::Snapshot(e.to_string()))?
        } else {
            serde_yaml::from_str(&text).map_err(|e| EngineError::Snapshot(e.to_string()))?
        };
        let serde_json::Value::Object(mut doc) = doc else {
            return Err(EngineError::Snapshot(format!(
                "{}: expected a top-level mapping",
                path.display()
            )));
        };

        let cell_map = match doc.remove("cell_map") {
            Some(serde_json::Value::Object(map)) => map,
            _ => {
                return Err(EngineError::Snapshot(format!(
                    "{}: missing cell_map",
                    path.display()
                )));
            }
        };
        let excel_hash = match doc.remove("excel_hash") {
            Some(serde_json::Value::String(h)) => Some(h),
            _ => None,
        };

        let entries = cell_map.iter().map(|(key, value)| {
            let entry = match value {
                serde_json::Value::String(s) if s.starts_with('=') => {
                    ReplayEntry::Formula(s.clone())
                }
                other => ReplayEntry::Literal(json_to_value(other)),
            };
            (key.clone(), entry)
        });
        let source = ReplaySource::new(entries);

        let mut compiler = Compiler::new(Box::new(source), expr_compiler);

        let mut ranges: Vec<Address> = Vec::new();
        for key in cell_map.keys() {
            let addr = Address::parse(key)?;
            if addr.is_range() {
                ranges.push(addr);
                continue;
            }
            if !compiler.contains_address(&addr.canonical()) {
                compiler.gen_graph(addr, true)?;
            }
        }
        for addr in ranges {
            if !compiler.contains_address(&addr.canonical()) {
                compiler.gen_graph(addr, true)?;
            }
        }
        compiler.process_graph_todos()?;

        compiler.excel_hash = excel_hash;
        compiler.extra_data = if doc.is_empty() { None } else { Some(doc) };
        compiler.filename = Some(path.with_extension(""));
        // the replay source has served its purpose
        compiler.source = None;
        Ok(compiler)
    }

    pub(crate) fn write_binary(&self, path: &Path) -> Result<(), EngineError> {
        let nodes = self
            .graph
            .iter_ids()
            .map(|id| {
                let node = self.graph.node(id);
                NodeRecord {
                    address: node.canonical(),
                    kind: match node {
                        Node::Cell(c) => NodeRecordKind::Cell { id: c.id },
                        Node::Range(_) => NodeRecordKind::Range,
                    },
                    value: node.value().cloned(),
                    formula: node.formula().map(|f| f.text.clone()),
                }
            })
            .collect();

        let snapshot = BinarySnapshot {
            version: BINARY_FORMAT_VERSION,
            excel_hash: self.excel_hash.clone(),
            extra_data: match &self.extra_data {
                Some(extra) => Some(
                    serde_json::to_string(extra)
                        .map_err(|e| EngineError::Snapshot(e.to_string()))?,
                ),
                None => None,
            },
            max_iterations: self.max_iterations,
            filename: self.filename.clone(),
            nodes,
        };
        let bytes =
            bincode::serialize(&snapshot).map_err(|e| EngineError::Snapshot(e.to_string()))?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub(crate) fn from_binary(
        path: &Path,
        expr_compiler: Arc<dyn ExprCompiler>,
    ) -> Result<Compiler, EngineError> {
        let bytes = fs::read(path)?;
        let snapshot: BinarySnapshot =
            bincode::deserialize(&bytes).map_err(|e| EngineError::Snapshot(e.to_string()))?;
        if snapshot.version != BINARY_FORMAT_VERSION {
            return Err(EngineError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let extra_data = match snapshot.extra_data {
            Some(text) => Some(
                serde_json::from_str(&text).map_err(|e| EngineError::Snapshot(e.to_string()))?,
            ),
            None => None,
        };

        let mut compiler = Compiler {
            source: None,
            expr_compiler,
            graph: DepGraph::new(),
            graph_todos: Vec::new(),
            range_todos: Vec::new(),
            excel_hash: snapshot.excel_hash,
            extra_data,
            max_iterations: snapshot.max_iterations,
            filename: snapshot.filename,
        };

        let mut max_id = 0;
        for record in snapshot.nodes {
            let addr = Address::parse(&record.address)?;
            let compiled = match record.formula {
                Some(text) => Some(formula::compile(&*compiler.expr_compiler, &text, &addr)?),
                None => None,
            };
            let node = match record.kind {
                NodeRecordKind::Cell { id } => {
                    max_id = max_id.max(id);
                    Node::Cell(CellNode {
                        address: addr,
                        value: record.value,
                        formula: compiled,
                        iterations: 0,
                        id,
                    })
                }
                NodeRecordKind::Range => {
                    let range = addr
                        .as_range()
                        .ok_or_else(|| {
                            EngineError::Snapshot(format!(
                                "range record with cell address {}",
                                record.address
                            ))
                        })?
                        .clone();
                    let addresses = range.resolve_range()?;
                    let size = range.size();
                    Node::Range(RangeNode {
                        address: range,
                        value: record.value,
                        formula: compiled,
                        addresses,
                        size,
                        iterations: 0,
                    })
                }
            };
            compiler.graph.insert(node);
        }
        compiler.graph.bump_cell_counter(max_id);

        // edges are a pure function of the node set; rewire from the
        // recompiled precedent sets
        let ids: Vec<_> = compiler.graph.iter_ids().collect();
        for id in ids {
            if !compiler.graph.node(id).has_precedents() {
                continue;
            }
            for precedent in compiler.graph.node(id).needed_addresses() {
                match compiler.graph.id_of(&precedent.canonical()) {
                    Some(pid) => compiler.graph.add_edge(pid, id),
                    None => warn!(address = %precedent, "missing precedent after reload"),
                }
            }
        }
        Ok(compiler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_value_round_trip() {
        let cases = [
            Value::Int(42),
            Value::Number(1.5),
            Value::Text("hello".into()),
            Value::Bool(true),
            Value::Empty,
            Value::Error(CellError::new(CellErrorKind::Value)),
        ];
        for value in cases {
            assert_eq!(json_to_value(&value_to_json(&value)), value);
        }
    }

    #[test]
    fn error_strings_parse_back() {
        let json = serde_json::Value::from("#DIV/0!");
        assert_eq!(
            json_to_value(&json),
            Value::Error(CellError::new(CellErrorKind::Div))
        );
        assert_eq!(
            json_to_value(&serde_json::Value::from("plain text")),
            Value::Text("plain text".into())
        );
    }
}

//! Snapshot round trips: text, binary, kind negotiation, integrity hash.

use std::fs;
use std::sync::Arc;

use cellgraph_engine::{Compiler, EngineError, ExprCompiler, Value};
use cellgraph_testkit::{FixtureCompiler, InMemoryWorkbook};

fn expr_compiler() -> Arc<dyn ExprCompiler> {
    Arc::new(FixtureCompiler::new())
}

fn compiler(workbook: InMemoryWorkbook) -> Compiler {
    Compiler::new(Box::new(workbook), expr_compiler())
}

fn fixture() -> InMemoryWorkbook {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("A1", 100);
    wb.set_formula("B1", "=1/A1");
    wb.set_formula("C1", "=B1*(-3.91)");
    wb.set_formula("D1", "=C1+0.01624");
    wb.set_value("E1", 1);
    wb.set_value("E2", 2);
    wb.set_formula("F1", "=SUM(E:E)");
    wb
}

fn assert_close(value: &Value, expected: f64, places: i32) {
    let got = value.as_number().unwrap_or_else(|| panic!("not numeric: {value:?}"));
    let scale = 10f64.powi(places);
    assert!(
        ((got - expected) * scale).abs() < 0.5,
        "expected {expected} to {places} places, got {got}"
    );
}

fn round_trip_text(extension: &str) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(format!("book.{extension}"));

    let mut live = compiler(fixture());
    let d1 = live.evaluate("Sheet1!D1").unwrap();
    let f1 = live.evaluate("Sheet1!F1").unwrap();
    live.to_file(Some(&path), &[extension]).unwrap();

    let mut reloaded = Compiler::from_file(&path, expr_compiler()).unwrap();
    assert_eq!(reloaded.evaluate("Sheet1!D1").unwrap(), d1);
    assert_eq!(reloaded.evaluate("Sheet1!F1").unwrap(), f1);

    // a mutated input recomputes identically live and replayed
    live.set_value("Sheet1!A1", 200).unwrap();
    reloaded.set_value("Sheet1!A1", 200).unwrap();
    assert_eq!(
        live.evaluate("Sheet1!D1").unwrap(),
        reloaded.evaluate("Sheet1!D1").unwrap()
    );
    assert_close(&reloaded.evaluate("Sheet1!D1").unwrap(), -0.00331, 5);
}

#[test]
fn yaml_round_trip() {
    round_trip_text("yml");
}

#[test]
fn json_round_trip() {
    round_trip_text("json");
}

#[test]
fn binary_round_trip_through_save() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("book");

    let mut live = compiler(fixture());
    let d1 = live.evaluate("Sheet1!D1").unwrap();
    live.to_file(Some(&base), &["bin", "yml"]).unwrap();
    assert!(base.with_extension("yml").exists());
    assert!(base.with_extension("bin").exists());

    // explicit extension
    let mut reloaded =
        Compiler::from_file(&base.with_extension("bin"), expr_compiler()).unwrap();
    assert_eq!(reloaded.evaluate("Sheet1!D1").unwrap(), d1);

    // extensionless probing prefers the binary
    let mut probed = Compiler::from_file(&base, expr_compiler()).unwrap();
    assert_eq!(probed.evaluate("Sheet1!D1").unwrap(), d1);

    // and the binary survives a further text round trip
    let text_path = dir.path().join("book2.json");
    reloaded.to_file(Some(&text_path), &["json"]).unwrap();
    let mut again = Compiler::from_file(&text_path, expr_compiler()).unwrap();
    assert_eq!(again.evaluate("Sheet1!D1").unwrap(), d1);
}

#[test]
fn binary_only_save_cleans_up_text_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("book");

    let mut live = compiler(fixture());
    live.evaluate("Sheet1!D1").unwrap();
    live.to_file(Some(&base), &["bin"]).unwrap();

    assert!(base.with_extension("bin").exists());
    assert!(!base.with_extension("yml").exists());
}

#[test]
fn unchanged_content_skips_binary_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("book");
    let bin_path = base.with_extension("bin");

    let mut live = compiler(fixture());
    live.evaluate("Sheet1!D1").unwrap();
    live.to_file(Some(&base), &["bin", "yml"]).unwrap();

    // plant a sentinel; an unchanged text artifact must not rewrite it
    fs::write(&bin_path, b"sentinel").unwrap();
    live.to_file(Some(&base), &["bin", "yml"]).unwrap();
    assert_eq!(fs::read(&bin_path).unwrap(), b"sentinel");

    // a real change rewrites the binary
    live.set_value("Sheet1!A1", 123).unwrap();
    live.to_file(Some(&base), &["bin", "yml"]).unwrap();
    assert_ne!(fs::read(&bin_path).unwrap(), b"sentinel");
}

#[test]
fn unknown_and_ambiguous_kinds_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("book");
    let c = compiler(fixture());

    let err = c.to_file(Some(&base), &["exe"]).unwrap_err();
    assert!(matches!(err, EngineError::UnrecognizedFileKind(_)));

    let err = c.to_file(Some(&base), &["yml", "json"]).unwrap_err();
    assert!(matches!(err, EngineError::AmbiguousFileKind(_)));
}

#[test]
fn loading_a_missing_snapshot_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = Compiler::from_file(&dir.path().join("nothing"), expr_compiler()).unwrap_err();
    assert!(matches!(err, EngineError::UnrecognizedFileKind(_)));
}

#[test]
fn extra_data_survives_the_text_form() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("book.json");

    let mut live = compiler(fixture());
    live.evaluate("Sheet1!D1").unwrap();
    let mut extra = serde_json::Map::new();
    extra.insert("project".to_string(), serde_json::Value::from("alpha"));
    live.set_extra_data(extra);
    live.to_file(Some(&path), &["json"]).unwrap();

    // visible as an opaque top-level key
    let text = fs::read_to_string(&path).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(doc["project"], "alpha");
    assert!(doc["cell_map"].is_object());

    let reloaded = Compiler::from_file(&path, expr_compiler()).unwrap();
    assert_eq!(
        reloaded.extra_data().unwrap()["project"],
        serde_json::Value::from("alpha")
    );
}

#[test]
fn cell_map_is_ordered_by_sort_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("book.json");

    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("B2", 1);
    wb.set_value("A2", 2);
    wb.set_value("B1", 3);
    wb.set_formula("C1", "=A2+B1+B2");
    let mut c = compiler(wb);
    c.evaluate("Sheet1!C1").unwrap();
    c.to_file(Some(&path), &["json"]).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    let keys: Vec<&str> = doc["cell_map"]
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(
        keys,
        ["Sheet1!B1", "Sheet1!C1", "Sheet1!A2", "Sheet1!B2"]
    );
}

#[test]
fn hash_matches_tracks_the_source_file() {
    let dir = tempfile::tempdir().unwrap();
    let workbook_path = dir.path().join("numbers.xlsx");
    fs::write(&workbook_path, b"workbook bytes").unwrap();

    let c = compiler(fixture()).with_workbook_file(&workbook_path);
    assert!(c.hash_matches());

    fs::write(&workbook_path, b"workbook bytes, edited").unwrap();
    assert!(!c.hash_matches());
}

#[test]
fn reloaded_snapshot_keeps_the_workbook_hash() {
    let dir = tempfile::tempdir().unwrap();
    let workbook_path = dir.path().join("numbers.xlsx");
    fs::write(&workbook_path, b"workbook bytes").unwrap();
    let snapshot_path = dir.path().join("book.yml");

    let mut live = compiler(fixture()).with_workbook_file(&workbook_path);
    live.evaluate("Sheet1!D1").unwrap();
    let hash = live.excel_hash().unwrap().to_string();
    live.to_file(Some(&snapshot_path), &["yml"]).unwrap();

    let reloaded = Compiler::from_file(&snapshot_path, expr_compiler()).unwrap();
    assert_eq!(reloaded.excel_hash(), Some(hash.as_str()));
}

#[test]
fn unqualified_addresses_need_a_live_source_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("book.yml");

    let mut live = compiler(fixture());
    live.evaluate("Sheet1!D1").unwrap();
    live.to_file(Some(&path), &["yml"]).unwrap();

    let mut reloaded = Compiler::from_file(&path, expr_compiler()).unwrap();
    // qualified lookups work, unqualified ones have no sheet to resolve to
    assert!(reloaded.evaluate("Sheet1!D1").is_ok());
    let err = reloaded.evaluate("D1").unwrap_err();
    assert!(matches!(err, EngineError::UnknownAddress(_)));
}

#[test]
fn explicit_extension_overrides_requested_kinds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("book.json");

    let mut live = compiler(fixture());
    live.evaluate("Sheet1!D1").unwrap();
    // the json extension pins the kind even though yml+bin were asked for
    live.to_file(Some(&path), &["bin", "yml"]).unwrap();
    assert!(path.exists());
    assert!(!dir.path().join("book.bin").exists());
    assert!(!dir.path().join("book.yml").exists());
}

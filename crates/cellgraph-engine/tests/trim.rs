//! Graph trimming: minimal subgraph extraction and its diagnostics.

use std::sync::Arc;

use cellgraph_engine::{Compiler, EngineError, Value};
use cellgraph_testkit::{FixtureCompiler, InMemoryWorkbook};

fn compiler(workbook: InMemoryWorkbook) -> Compiler {
    Compiler::new(Box::new(workbook), Arc::new(FixtureCompiler::new()))
}

fn fixture() -> InMemoryWorkbook {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("A1", 10);
    wb.set_formula("B1", "=A1*2");
    wb.set_formula("C1", "=B1+G1");
    wb.set_formula("G1", "=2+3");
    wb.set_value("D1", 7);
    wb.set_formula("E1", "=D1+C1");
    wb.set_formula("F1", "=A1*3");
    wb
}

#[test]
fn trimming_preserves_output_values() {
    let mut c = compiler(fixture());
    let before = c.evaluate("Sheet1!E1").unwrap();

    c.trim(&["Sheet1!A1", "Sheet1!D1"], &["Sheet1!E1"]).unwrap();

    assert_eq!(c.evaluate("Sheet1!E1").unwrap(), before);

    // unrelated formula cells are gone
    assert!(!c.contains_address("Sheet1!F1"));
    // the computation path survives with formulas intact
    assert!(c.contains_address("Sheet1!B1"));
    assert_eq!(c.formula_text("Sheet1!B1").as_deref(), Some("=A1*2"));
}

#[test]
fn trimming_tracks_input_changes_afterwards() {
    let mut c = compiler(fixture());
    c.evaluate("Sheet1!E1").unwrap();
    c.trim(&["Sheet1!A1", "Sheet1!D1"], &["Sheet1!E1"]).unwrap();

    c.set_value("Sheet1!A1", 20).unwrap();
    // E1 = D1 + (A1*2 + 5) = 7 + 45
    assert_eq!(c.evaluate("Sheet1!E1").unwrap(), Value::Number(52.0));

    c.set_value("Sheet1!D1", 10).unwrap();
    assert_eq!(c.evaluate("Sheet1!E1").unwrap(), Value::Number(55.0));
}

#[test]
fn precedents_outside_the_varied_set_freeze_to_literals() {
    let mut c = compiler(fixture());
    c.evaluate("Sheet1!E1").unwrap();
    c.trim(&["Sheet1!A1"], &["Sheet1!E1"]).unwrap();

    // G1 cannot vary with A1, so only its value is kept
    assert!(c.contains_address("Sheet1!G1"));
    assert_eq!(c.formula_text("Sheet1!G1"), None);
    assert_eq!(c.cached_value("Sheet1!G1"), Some(Value::Number(5.0)));

    // D1 was a literal already and survives the same way
    assert!(c.contains_address("Sheet1!D1"));
    assert_eq!(c.evaluate("Sheet1!E1").unwrap(), Value::Number(32.0));
}

#[test]
fn unconnected_input_is_an_error() {
    let mut c = compiler(fixture());
    let err = c
        .trim(&["Sheet1!D2"], &["Sheet1!E1"])
        .unwrap_err();
    match err {
        EngineError::Trim(message) => {
            assert!(message.contains("Sheet1!D2"), "message: {message}");
        }
        other => panic!("expected a trim error, got {other:?}"),
    }
}

#[test]
fn input_without_dependents_is_an_error() {
    let mut wb = fixture();
    wb.set_value("H1", 1);
    let mut c = compiler(wb);
    c.build("Sheet1!H1").unwrap();

    let err = c.trim(&["Sheet1!H1"], &["Sheet1!E1"]).unwrap_err();
    assert!(matches!(err, EngineError::Trim(_)));
}

#[test]
fn output_input_without_dependents_only_warns() {
    let mut c = compiler(fixture());
    // E1 has no dependents of its own, but it is also a requested output
    c.trim(
        &["Sheet1!A1", "Sheet1!D1", "Sheet1!E1"],
        &["Sheet1!E1"],
    )
    .unwrap();
    assert!(c.contains_address("Sheet1!E1"));
    assert!(c.evaluate("Sheet1!E1").unwrap().as_number().is_some());
}

#[test]
fn buried_inputs_keep_their_formulas() {
    let mut c = compiler(fixture());
    c.evaluate("Sheet1!E1").unwrap();

    // B1 depends on the other input A1: a non-leaf input, flagged only
    c.trim(&["Sheet1!A1", "Sheet1!B1"], &["Sheet1!E1"]).unwrap();
    assert_eq!(c.formula_text("Sheet1!B1").as_deref(), Some("=A1*2"));

    c.set_value("Sheet1!A1", 20).unwrap();
    assert_eq!(c.evaluate("Sheet1!E1").unwrap(), Value::Number(52.0));
}

#[test]
fn ranges_on_the_precedent_path_survive() {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("A1", 1);
    wb.set_value("A2", 2);
    wb.set_value("A3", 3);
    wb.set_formula("B1", "=SUM(A1:A3)");
    let mut c = compiler(wb);
    c.evaluate("Sheet1!B1").unwrap();

    c.trim(&["Sheet1!A1"], &["Sheet1!B1"]).unwrap();

    assert!(c.contains_address("Sheet1!A1:A3"));
    for addr in ["Sheet1!A1", "Sheet1!A2", "Sheet1!A3"] {
        assert!(c.contains_address(addr), "missing {addr}");
    }
    c.set_value("Sheet1!A1", 10).unwrap();
    assert_eq!(c.evaluate("Sheet1!B1").unwrap(), Value::Number(15.0));
}

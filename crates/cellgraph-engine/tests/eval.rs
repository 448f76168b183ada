//! Evaluation: memoization, invalidation, shapes, circular convergence.

use std::sync::Arc;

use cellgraph_engine::{CellErrorKind, Compiler, EngineError, Value};
use cellgraph_testkit::{FixtureCompiler, InMemoryWorkbook};

fn compiler(workbook: InMemoryWorkbook) -> Compiler {
    Compiler::new(Box::new(workbook), Arc::new(FixtureCompiler::new()))
}

fn number(value: &Value) -> f64 {
    value.as_number().unwrap_or_else(|| panic!("not numeric: {value:?}"))
}

fn assert_close(value: &Value, expected: f64, places: i32) {
    let got = number(value);
    let scale = 10f64.powi(places);
    assert!(
        ((got - expected) * scale).abs() < 0.5,
        "expected {expected} to {places} places, got {got}"
    );
}

/// The example chain: D1 nets to -0.02286 with A1=100.
fn example_chain() -> InMemoryWorkbook {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("A1", 100);
    wb.set_formula("B1", "=1/A1");
    wb.set_formula("C1", "=B1*(-3.91)");
    wb.set_formula("D1", "=C1+0.01624");
    wb
}

#[test]
fn evaluates_chain_and_memoizes() {
    let mut c = compiler(example_chain());
    assert_close(&c.evaluate("Sheet1!D1").unwrap(), -0.02286, 5);

    // intermediate results are cached
    assert!(c.cached_value("Sheet1!B1").is_some());
    assert!(c.cached_value("Sheet1!C1").is_some());
}

#[test]
fn mutation_invalidates_transitive_dependents() {
    let mut c = compiler(example_chain());
    assert_close(&c.evaluate("Sheet1!D1").unwrap(), -0.02286, 5);

    c.set_value("Sheet1!A1", 200).unwrap();
    assert_eq!(c.cached_value("Sheet1!B1"), None);
    assert_eq!(c.cached_value("Sheet1!C1"), None);
    assert_eq!(c.cached_value("Sheet1!D1"), None);

    assert_close(&c.evaluate("Sheet1!D1").unwrap(), -0.00331, 5);
}

#[test]
fn mutation_leaves_unrelated_cells_cached() {
    let mut wb = example_chain();
    wb.set_value("F1", 5);
    wb.set_formula("G1", "=F1+1");
    let mut c = compiler(wb);

    c.evaluate("Sheet1!D1").unwrap();
    c.evaluate("Sheet1!G1").unwrap();
    assert!(c.cached_value("Sheet1!G1").is_some());

    c.set_value("Sheet1!A1", 200).unwrap();
    assert!(c.cached_value("Sheet1!G1").is_some());
    assert_eq!(c.cached_value("Sheet1!D1"), None);
}

#[test]
fn setting_the_same_value_is_a_no_op() {
    let mut c = compiler(example_chain());
    c.evaluate("Sheet1!D1").unwrap();

    c.set_value("Sheet1!A1", 100).unwrap();
    assert!(c.cached_value("Sheet1!D1").is_some());
}

#[test]
fn vectorized_assignment_distributes() {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("A1", 1);
    wb.set_value("A2", 2);
    wb.set_formula("B1", "=SUM(A1:A2)");
    let mut c = compiler(wb);
    assert_eq!(c.evaluate("Sheet1!B1").unwrap(), Value::Number(3.0));

    // a flat sequence spreads over the range's member cells
    c.set_value_with(
        "Sheet1!A1:A2",
        Value::Array(vec![vec![Value::Int(10), Value::Int(20)]]),
        false,
    )
    .unwrap();
    assert_eq!(c.evaluate("Sheet1!B1").unwrap(), Value::Number(30.0));

    // parallel address/value slices
    c.set_values(
        &["Sheet1!A1", "Sheet1!A2"],
        &[Value::Int(3), Value::Int(4)],
    )
    .unwrap();
    assert_eq!(c.evaluate("Sheet1!B1").unwrap(), Value::Number(7.0));
}

#[test]
fn mismatched_assignment_shape_is_rejected() {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("A1", 1);
    wb.set_value("A2", 2);
    let mut c = compiler(wb);
    c.build("Sheet1!A1:A2").unwrap();

    let err = c
        .set_value_with(
            "Sheet1!A1:A2",
            Value::Array(vec![vec![Value::Int(1), Value::Int(2), Value::Int(3)]]),
            false,
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::ShapeMismatch(_)));

    let err = c
        .set_values(&["Sheet1!A1"], &[Value::Int(1), Value::Int(2)])
        .unwrap_err();
    assert!(matches!(err, EngineError::ShapeMismatch(_)));
}

#[test]
fn set_as_range_assigns_whole_grid() {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("A1", 1);
    wb.set_value("A2", 2);
    let mut c = compiler(wb);
    c.build("Sheet1!A1:A2").unwrap();

    let grid = Value::Array(vec![vec![Value::Int(7)], vec![Value::Int(8)]]);
    c.set_value_with("Sheet1!A1:A2", grid.clone(), true).unwrap();
    assert_eq!(c.cached_value("Sheet1!A1:A2"), Some(grid));
}

#[test]
fn grid_shapes_collapse() {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("A1", 1);
    wb.set_value("B1", 2);
    wb.set_value("A2", 3);
    wb.set_value("B2", 4);
    let mut c = compiler(wb);

    // one column -> flat sequence
    assert_eq!(
        c.evaluate("Sheet1!A1:A2").unwrap(),
        Value::Array(vec![vec![Value::Int(1), Value::Int(3)]])
    );
    // one row -> flat sequence
    assert_eq!(
        c.evaluate("Sheet1!A1:B1").unwrap(),
        Value::Array(vec![vec![Value::Int(1), Value::Int(2)]])
    );
    // full block keeps both dimensions
    assert_eq!(
        c.evaluate("Sheet1!A1:B2").unwrap(),
        Value::Array(vec![
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::Int(3), Value::Int(4)],
        ])
    );
    // a single cell is never a sequence
    assert_eq!(c.evaluate("Sheet1!A1").unwrap(), Value::Int(1));
}

#[test]
fn scalar_cell_coerces_grid_result_to_error() {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("A1", 1);
    wb.set_value("A2", 2);
    wb.set_formula("C1", "=A1:A2");
    let mut c = compiler(wb);

    match c.evaluate("Sheet1!C1").unwrap() {
        Value::Error(e) => assert_eq!(e.kind, CellErrorKind::Value),
        other => panic!("expected an error value, got {other:?}"),
    }
}

#[test]
fn circular_references_converge_under_iteration_cap() {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_formula("B1", "=(B3-B2)/5");
    wb.set_formula("B2", "=B1");
    wb.set_value("B3", 100);
    let mut c = compiler(wb).with_max_iterations(100);

    let b2 = number(&c.evaluate("Sheet1!B2").unwrap());
    assert!((b2 - 16.666_666_7).abs() / 16.666_666_7 < 1e-6, "got {b2}");

    // the converged output tracks the upstream input monotonically
    c.set_value("Sheet1!B3", 200).unwrap();
    let b2 = number(&c.evaluate("Sheet1!B2").unwrap());
    assert!((b2 - 33.333_333_3).abs() / 33.333_333_3 < 1e-6, "got {b2}");

    c.set_value("Sheet1!B3", 500).unwrap();
    let b2 = number(&c.evaluate("Sheet1!B2").unwrap());
    assert!((b2 - 83.333_333_3).abs() / 83.333_333_3 < 1e-6, "got {b2}");
}

#[test]
fn divergent_self_reference_still_terminates() {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_formula("A1", "=A1+1");
    let mut c = compiler(wb).with_max_iterations(20);

    // no convergence exists; the cap guarantees termination with a value
    let value = c.evaluate("Sheet1!A1").unwrap();
    assert!(value.as_number().is_some(), "got {value:?}");
}

#[test]
fn recalculate_recomputes_stale_workbook_values() {
    let mut wb = InMemoryWorkbook::new("Sheet1");
    wb.set_value("A1", 10);
    // the workbook recorded a stale result for B1
    wb.set_formula_with_value("B1", "=A1*2", 999);
    let mut c = compiler(wb);

    // demand-driven evaluation trusts the recorded value
    assert_eq!(c.evaluate("Sheet1!B1").unwrap(), Value::Int(999));

    // eager recalculation clears and recomputes everything
    c.recalculate().unwrap();
    assert_eq!(c.evaluate("Sheet1!B1").unwrap(), Value::Number(20.0));
}

#[test]
fn evaluate_many_returns_like_shaped_results() {
    let mut c = compiler(example_chain());
    let values = c
        .evaluate_many(&["Sheet1!A1", "Sheet1!D1"])
        .unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0], Value::Int(100));
    assert_close(&values[1], -0.02286, 5);
}

#[test]
fn value_tree_renders_precedents() {
    let mut c = compiler(example_chain());
    c.evaluate("Sheet1!D1").unwrap();

    let lines = c.value_tree("Sheet1!D1").unwrap();
    assert!(lines[0].starts_with("Sheet1!D1 = "));
    assert!(lines.iter().any(|l| l.contains("Sheet1!A1 = 100")));
    // children indent one space per level
    assert!(lines.iter().any(|l| l.starts_with(" Sheet1!C1 = ")));
}

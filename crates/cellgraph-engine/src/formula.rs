//! The formula seam.
//!
//! The formula language itself lives outside this crate. The engine sees a
//! compiled formula only through [`CompiledExpr`]: the precedent addresses it
//! reads, and an invocation that pulls values through an [`EvalContext`] so
//! nested references recurse through the engine's cache instead of
//! re-entering construction.

use std::sync::Arc;

use cellgraph_common::{Address, EngineError, Value};

use crate::node::Formula;

/// Evaluation callbacks handed to a formula at invocation time. Implemented
/// by the engine; bound to the current evaluation pass.
pub trait EvalContext {
    /// Evaluate one cell address (canonical, sheet-qualified).
    fn evaluate(&mut self, address: &str) -> Result<Value, EngineError>;
    /// Evaluate one range address to its aggregate (grid) value.
    fn evaluate_range(&mut self, address: &str) -> Result<Value, EngineError>;
}

/// A compiled, executable formula.
pub trait CompiledExpr: std::fmt::Debug + Send + Sync {
    /// The formula source text, starting with `=`.
    fn source(&self) -> &str;
    /// The addresses this formula reads.
    fn needed_addresses(&self) -> &[Address];
    /// Execute against the engine's evaluation callbacks. Errors raised here
    /// propagate to the evaluation caller unmodified.
    fn invoke(&self, ctx: &mut dyn EvalContext) -> Result<Value, EngineError>;
}

/// Compiles formula text into an executable expression. The `origin` address
/// supplies the sheet against which unqualified references resolve.
pub trait ExprCompiler: Send + Sync {
    fn compile(&self, text: &str, origin: &Address)
    -> Result<Arc<dyn CompiledExpr>, EngineError>;
}

pub(crate) const REF_START: &str = "=_REF_(\"";
pub(crate) const REF_END: &str = "\")";

/// Formula text of a synthetic redirect to `target`.
pub(crate) fn ref_formula(target: &Address) -> String {
    format!("{REF_START}{target}{REF_END}")
}

/// Extract the target address text from a redirect formula, if it is one.
pub(crate) fn parse_ref_formula(text: &str) -> Option<&str> {
    text.strip_prefix(REF_START)?.strip_suffix(REF_END)
}

/// The one engine-internal expression kind: an opaque reference created for
/// redirect nodes. Evaluates to a reference value that the engine
/// dereferences on read.
#[derive(Debug)]
struct RefExpr {
    text: String,
    target: [Address; 1],
}

impl CompiledExpr for RefExpr {
    fn source(&self) -> &str {
        &self.text
    }

    fn needed_addresses(&self) -> &[Address] {
        &self.target
    }

    fn invoke(&self, _ctx: &mut dyn EvalContext) -> Result<Value, EngineError> {
        Ok(Value::Ref(self.target[0].clone()))
    }
}

/// Compile formula text into a node formula, routing redirect sentinels to
/// the internal reference expression and everything else to the external
/// compiler.
pub(crate) fn compile(
    compiler: &dyn ExprCompiler,
    text: &str,
    origin: &Address,
) -> Result<Formula, EngineError> {
    if let Some(inner) = parse_ref_formula(text) {
        let target = Address::parse(inner)?;
        return Ok(Formula {
            text: text.to_string(),
            expr: Arc::new(RefExpr {
                text: text.to_string(),
                target: [target],
            }),
        });
    }
    Ok(Formula {
        text: text.to_string(),
        expr: compiler.compile(text, origin)?,
    })
}

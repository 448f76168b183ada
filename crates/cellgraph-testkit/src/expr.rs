//! A small formula compiler for exercising the engine.
//!
//! Supports numbers, cell and range references (optionally sheet-qualified,
//! including whole-column forms like `A:A`), the four arithmetic operators
//! plus `^`, parentheses, unary minus, and function calls resolved through
//! an explicitly constructed [`FunctionRegistry`]. Unknown functions compile
//! fine and fail at evaluation time, which is what bulk verification
//! classifies.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use cellgraph_common::{
    Address, CellError, CellErrorKind, EngineError, FormulaError, Value,
};
use cellgraph_engine::formula::{CompiledExpr, EvalContext, ExprCompiler};

/* ───────────────────────── function registry ───────────────────────── */

pub type BuiltinFn = fn(&[Value]) -> Result<Value, FormulaError>;

/// Named functions available to compiled formulas. Constructed explicitly
/// and shared by the compiler; no ambient global state.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: FxHashMap<String, BuiltinFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock set: SUM, MIN, MAX, ABS, AVERAGE.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("SUM", builtin_sum);
        registry.register("MIN", builtin_min);
        registry.register("MAX", builtin_max);
        registry.register("ABS", builtin_abs);
        registry.register("AVERAGE", builtin_average);
        registry
    }

    pub fn register(&mut self, name: &str, function: BuiltinFn) {
        self.functions.insert(name.to_ascii_uppercase(), function);
    }

    fn get(&self, name: &str) -> Option<BuiltinFn> {
        self.functions.get(&name.to_ascii_uppercase()).copied()
    }
}

/// Numeric operands of a function call: args flattened row-major, errors
/// propagated, text and empties skipped.
fn numeric_operands(args: &[Value]) -> Result<Vec<f64>, Value> {
    let mut out = Vec::new();
    for arg in args {
        for value in arg.flatten() {
            match value {
                Value::Error(e) => return Err(Value::Error(e)),
                Value::Int(i) => out.push(i as f64),
                Value::Number(n) => out.push(n),
                Value::Bool(b) => out.push(if b { 1.0 } else { 0.0 }),
                _ => {}
            }
        }
    }
    Ok(out)
}

fn builtin_sum(args: &[Value]) -> Result<Value, FormulaError> {
    match numeric_operands(args) {
        Err(err) => Ok(err),
        Ok(nums) => Ok(Value::Number(nums.iter().sum())),
    }
}

fn builtin_min(args: &[Value]) -> Result<Value, FormulaError> {
    match numeric_operands(args) {
        Err(err) => Ok(err),
        Ok(nums) => Ok(Value::Number(nums.iter().copied().fold(f64::INFINITY, f64::min))),
    }
}

fn builtin_max(args: &[Value]) -> Result<Value, FormulaError> {
    match numeric_operands(args) {
        Err(err) => Ok(err),
        Ok(nums) => Ok(Value::Number(
            nums.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        )),
    }
}

fn builtin_abs(args: &[Value]) -> Result<Value, FormulaError> {
    match numeric_operands(args) {
        Err(err) => Ok(err),
        Ok(nums) => match nums.first() {
            Some(n) => Ok(Value::Number(n.abs())),
            None => Ok(Value::Error(CellError::new(CellErrorKind::Value))),
        },
    }
}

fn builtin_average(args: &[Value]) -> Result<Value, FormulaError> {
    match numeric_operands(args) {
        Err(err) => Ok(err),
        Ok(nums) if nums.is_empty() => Ok(Value::Error(CellError::new(CellErrorKind::Div))),
        Ok(nums) => Ok(Value::Number(nums.iter().sum::<f64>() / nums.len() as f64)),
    }
}

/* ─────────────────────────────── lexer ─────────────────────────────── */

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ref(Address),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
}

fn is_ref_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '$' || c == '_'
}

fn lex(input: &str) -> Result<Vec<Tok>, FormulaError> {
    let bytes: Vec<char> = input.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '^' => {
                toks.push(Tok::Caret);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == '.') {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| FormulaError::Parse(format!("bad number '{text}'")))?;
                toks.push(Tok::Num(n));
            }
            '\'' => {
                // quoted sheet qualifier: read through the closing quote,
                // the '!', and the reference part
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i] != '\'' {
                    i += 1;
                }
                if i >= bytes.len() || bytes.get(i + 1) != Some(&'!') {
                    return Err(FormulaError::Parse(format!(
                        "unterminated sheet name in '{input}'"
                    )));
                }
                i += 2;
                while i < bytes.len() && (is_ref_char(bytes[i]) || bytes[i] == ':') {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let addr = Address::parse(&text)
                    .map_err(|e| FormulaError::Parse(e.to_string()))?;
                toks.push(Tok::Ref(addr));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < bytes.len() && is_ref_char(bytes[i]) {
                    i += 1;
                }
                if bytes.get(i) == Some(&'!') {
                    // sheet-qualified reference
                    i += 1;
                    while i < bytes.len() && (is_ref_char(bytes[i]) || bytes[i] == ':') {
                        i += 1;
                    }
                    let text: String = bytes[start..i].iter().collect();
                    let addr = Address::parse(&text)
                        .map_err(|e| FormulaError::Parse(e.to_string()))?;
                    toks.push(Tok::Ref(addr));
                    continue;
                }
                let word: String = bytes[start..i].iter().collect();
                if bytes.get(i) == Some(&':') {
                    // a range like A1:B2 or a whole-column span like A:A
                    let colon = i;
                    i += 1;
                    while i < bytes.len() && is_ref_char(bytes[i]) {
                        i += 1;
                    }
                    let text: String = bytes[start..i].iter().collect();
                    match Address::parse(&text) {
                        Ok(addr) => {
                            toks.push(Tok::Ref(addr));
                            continue;
                        }
                        // not a range after all; re-lex from the colon
                        Err(_) => i = colon,
                    }
                }
                if bytes.get(i) == Some(&'(') {
                    toks.push(Tok::Ident(word));
                } else {
                    let addr = Address::parse(&word)
                        .map_err(|_| FormulaError::Parse(format!("bad reference '{word}'")))?;
                    toks.push(Tok::Ref(addr));
                }
            }
            other => {
                return Err(FormulaError::Parse(format!(
                    "unexpected character '{other}' in '{input}'"
                )));
            }
        }
    }
    Ok(toks)
}

/* ─────────────────────────────── parser ────────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Ref(Address),
    Neg(Box<Expr>),
    Bin(Op, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), FormulaError> {
        match self.next() {
            Some(ref t) if t == tok => Ok(()),
            other => Err(FormulaError::Parse(format!(
                "expected {tok:?}, found {other:?}"
            ))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, FormulaError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => Op::Add,
                Some(Tok::Minus) => Op::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::Bin(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, FormulaError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => Op::Mul,
                Some(Tok::Slash) => Op::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Bin(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Tok::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Tok::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, FormulaError> {
        let base = self.parse_atom()?;
        if self.peek() == Some(&Tok::Caret) {
            self.pos += 1;
            let exp = self.parse_unary()?;
            return Ok(Expr::Bin(Op::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Ref(addr)) => Ok(Expr::Ref(addr)),
            Some(Tok::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Ident(name)) => {
                self.expect(&Tok::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Tok::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        match self.peek() {
                            Some(Tok::Comma) => {
                                self.pos += 1;
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(&Tok::RParen)?;
                Ok(Expr::Call(name, args))
            }
            other => Err(FormulaError::Parse(format!("unexpected token {other:?}"))),
        }
    }
}

fn qualify(expr: &mut Expr, sheet: &str) {
    match expr {
        Expr::Ref(addr) => {
            if !addr.has_sheet() {
                *addr = addr.with_sheet(sheet);
            }
        }
        Expr::Neg(inner) => qualify(inner, sheet),
        Expr::Bin(_, left, right) => {
            qualify(left, sheet);
            qualify(right, sheet);
        }
        Expr::Call(_, args) => {
            for arg in args {
                qualify(arg, sheet);
            }
        }
        Expr::Num(_) => {}
    }
}

fn collect_refs(expr: &Expr, out: &mut Vec<Address>, seen: &mut FxHashSet<String>) {
    match expr {
        Expr::Ref(addr) => {
            if seen.insert(addr.canonical()) {
                out.push(addr.clone());
            }
        }
        Expr::Neg(inner) => collect_refs(inner, out, seen),
        Expr::Bin(_, left, right) => {
            collect_refs(left, out, seen);
            collect_refs(right, out, seen);
        }
        Expr::Call(_, args) => {
            for arg in args {
                collect_refs(arg, out, seen);
            }
        }
        Expr::Num(_) => {}
    }
}

/* ──────────────────────────── evaluation ───────────────────────────── */

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Number(n) => Some(*n),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Empty => Some(0.0),
        _ => None,
    }
}

fn eval_binop(op: Op, left: Value, right: Value) -> Value {
    if matches!(left, Value::Error(_)) {
        return left;
    }
    if matches!(right, Value::Error(_)) {
        return right;
    }
    let (Some(x), Some(y)) = (coerce_number(&left), coerce_number(&right)) else {
        return Value::Error(CellError::new(CellErrorKind::Value));
    };
    match op {
        Op::Add => Value::Number(x + y),
        Op::Sub => Value::Number(x - y),
        Op::Mul => Value::Number(x * y),
        Op::Div => {
            if y == 0.0 {
                Value::Error(CellError::new(CellErrorKind::Div))
            } else {
                Value::Number(x / y)
            }
        }
        Op::Pow => Value::Number(x.powf(y)),
    }
}

fn eval_expr(
    expr: &Expr,
    registry: &FunctionRegistry,
    ctx: &mut dyn EvalContext,
) -> Result<Value, EngineError> {
    match expr {
        Expr::Num(n) => Ok(Value::Number(*n)),
        Expr::Ref(addr) => {
            if addr.is_range() {
                ctx.evaluate_range(&addr.canonical())
            } else {
                ctx.evaluate(&addr.canonical())
            }
        }
        Expr::Neg(inner) => {
            let value = eval_expr(inner, registry, ctx)?;
            if matches!(value, Value::Error(_)) {
                return Ok(value);
            }
            match coerce_number(&value) {
                Some(n) => Ok(Value::Number(-n)),
                None => Ok(Value::Error(CellError::new(CellErrorKind::Value))),
            }
        }
        Expr::Bin(op, left, right) => {
            let lv = eval_expr(left, registry, ctx)?;
            let rv = eval_expr(right, registry, ctx)?;
            Ok(eval_binop(*op, lv, rv))
        }
        Expr::Call(name, args) => {
            let function = registry.get(name).ok_or_else(|| {
                EngineError::Formula(FormulaError::NotImplemented {
                    function: name.clone(),
                })
            })?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, registry, ctx)?);
            }
            function(&values).map_err(EngineError::Formula)
        }
    }
}

/* ─────────────────────────── compiler seam ─────────────────────────── */

#[derive(Debug)]
struct FixtureExpr {
    text: String,
    ast: Expr,
    needed: Vec<Address>,
    registry: Arc<FunctionRegistry>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl CompiledExpr for FixtureExpr {
    fn source(&self) -> &str {
        &self.text
    }

    fn needed_addresses(&self) -> &[Address] {
        &self.needed
    }

    fn invoke(&self, ctx: &mut dyn EvalContext) -> Result<Value, EngineError> {
        eval_expr(&self.ast, &self.registry, ctx)
    }
}

/// Compiles fixture formulas against a shared function registry.
pub struct FixtureCompiler {
    registry: Arc<FunctionRegistry>,
}

impl FixtureCompiler {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(FunctionRegistry::with_builtins()),
        }
    }

    pub fn with_registry(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }
}

impl Default for FixtureCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExprCompiler for FixtureCompiler {
    fn compile(
        &self,
        text: &str,
        origin: &Address,
    ) -> Result<Arc<dyn CompiledExpr>, EngineError> {
        let body = text.strip_prefix('=').ok_or_else(|| {
            EngineError::Formula(FormulaError::Parse(format!(
                "formula must start with '=': '{text}'"
            )))
        })?;
        let toks = lex(body).map_err(EngineError::Formula)?;
        let mut parser = Parser { toks, pos: 0 };
        let mut ast = parser.parse_expr().map_err(EngineError::Formula)?;
        if parser.pos != parser.toks.len() {
            return Err(EngineError::Formula(FormulaError::Parse(format!(
                "trailing input in '{text}'"
            ))));
        }
        qualify(&mut ast, origin.sheet());
        let mut needed = Vec::new();
        collect_refs(&ast, &mut needed, &mut FxHashSet::default());
        Ok(Arc::new(FixtureExpr {
            text: text.to_string(),
            ast,
            needed,
            registry: self.registry.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(text: &str) -> Arc<dyn CompiledExpr> {
        let origin = Address::parse("S!A1").unwrap();
        FixtureCompiler::new().compile(text, &origin).unwrap()
    }

    struct NoCells;
    impl EvalContext for NoCells {
        fn evaluate(&mut self, address: &str) -> Result<Value, EngineError> {
            Err(EngineError::UnknownAddress(address.to_string()))
        }
        fn evaluate_range(&mut self, address: &str) -> Result<Value, EngineError> {
            Err(EngineError::UnknownAddress(address.to_string()))
        }
    }

    #[test]
    fn needed_addresses_are_qualified_and_deduped() {
        let expr = compile("=B1+Other!C2*B1+SUM(D1:D3)");
        let needed: Vec<String> = expr
            .needed_addresses()
            .iter()
            .map(|a| a.canonical())
            .collect();
        assert_eq!(needed, vec!["S!B1", "Other!C2", "S!D1:D3"]);
    }

    #[test]
    fn arithmetic_without_references() {
        let expr = compile("=2*(3+4)-10/4");
        assert_eq!(expr.invoke(&mut NoCells).unwrap(), Value::Number(11.5));

        let expr = compile("=-2^2");
        assert_eq!(expr.invoke(&mut NoCells).unwrap(), Value::Number(-4.0));
    }

    #[test]
    fn division_by_zero_is_an_error_value() {
        let expr = compile("=1/0");
        assert_eq!(
            expr.invoke(&mut NoCells).unwrap(),
            Value::Error(CellError::new(CellErrorKind::Div))
        );
    }

    #[test]
    fn unknown_function_fails_at_eval_not_compile() {
        let expr = compile("=FANCY(1,2)");
        let err = expr.invoke(&mut NoCells).unwrap_err();
        match err {
            EngineError::Formula(FormulaError::NotImplemented { function }) => {
                assert_eq!(function, "FANCY");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn whole_column_spans_lex_as_one_reference() {
        let expr = compile("=SUM(A:A)");
        let needed: Vec<String> = expr
            .needed_addresses()
            .iter()
            .map(|a| a.canonical())
            .collect();
        assert_eq!(needed, vec!["S!A:A"]);
    }

    #[test]
    fn parse_errors_are_reported() {
        let origin = Address::parse("S!A1").unwrap();
        let compiler = FixtureCompiler::new();
        assert!(compiler.compile("A1+1", &origin).is_err());
        assert!(compiler.compile("=1+", &origin).is_err());
        assert!(compiler.compile("=(1", &origin).is_err());
        assert!(compiler.compile("=1 ? 2", &origin).is_err());
    }
}

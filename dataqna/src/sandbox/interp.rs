//! Deterministic tree-walking interpreter for validated programs.
//!
//! Evaluation charges one operation per AST step and per iterated element
//! against `SandboxLimits::max_ops`, and polls the wall-clock deadline and
//! the cancel token on that same path. All program faults are caught and
//! classified; the interpreter never panics on untrusted input.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use tracing::{debug, instrument};

use crate::config::{AllowList, SandboxLimits};
use crate::lang::{self, ast, BinaryOp, Expr, ExprKind, Literal, Span, StmtKind, UnaryOp};
use crate::sandbox::builtins::{self, BuiltinError};
use crate::sandbox::{
    Bindings, CancelToken, ErrorDetail, ExecStatus, ExecutionOutcome, FaultKind, Value,
};

/// How many operations between wall-clock and cancellation polls.
const POLL_INTERVAL_OPS: u64 = 64;

/// Longest source fragment echoed into an [`ErrorDetail`].
const MAX_FRAGMENT_CHARS: usize = 120;

/// Executes candidate programs against read-only bindings.
///
/// A sandbox holds only a reference to the process-wide allow-list; it keeps
/// no state between runs, so replaying the same `(source, bindings)` pair
/// yields an identical outcome.
pub struct Sandbox<'a> {
    allow: &'a AllowList,
}

impl<'a> Sandbox<'a> {
    pub fn new(allow: &'a AllowList) -> Self {
        Self { allow }
    }

    #[instrument(skip_all, fields(source_len = source.len()))]
    pub fn execute(
        &self,
        source: &str,
        bindings: &Bindings,
        limits: &SandboxLimits,
        cancel: &CancelToken,
    ) -> ExecutionOutcome {
        let program = match lang::parse(source) {
            Ok(program) => program,
            Err(err) => {
                // The validator gates execution, so an unparseable program
                // here means the caller skipped validation.
                let (line, _) = ast::line_col(source, err.offset);
                return ExecutionOutcome::failure(
                    ExecStatus::RuntimeError,
                    ErrorDetail {
                        kind: FaultKind::InvalidArgument,
                        message: format!("program is not parseable: {}", err.message),
                        fragment: Some(format!("line {line}")),
                    },
                );
            }
        };

        let mut interp = Interp {
            source,
            allow: self.allow,
            bindings,
            limits,
            cancel,
            deadline: Instant::now() + limits.timeout(),
            ops: 0,
            imported: BTreeSet::new(),
            locals: BTreeMap::new(),
            params: Vec::new(),
        };

        match interp.run(&program) {
            Ok(result) => {
                debug!(ops = interp.ops, "execution succeeded");
                ExecutionOutcome::success(result)
            }
            Err(interrupt) => {
                let outcome = interp.outcome_for(interrupt);
                debug!(ops = interp.ops, status = ?outcome.status, "execution failed");
                outcome
            }
        }
    }
}

/// Why evaluation stopped early.
enum Interrupt {
    Fault(Fault),
    Timeout(Span),
    Resource(Span),
    Cancelled(Span),
}

struct Fault {
    kind: FaultKind,
    message: String,
    span: Span,
}

impl Fault {
    fn new(kind: FaultKind, span: Span, message: impl Into<String>) -> Interrupt {
        Interrupt::Fault(Fault {
            kind,
            message: message.into(),
            span,
        })
    }
}

type EvalResult = Result<Value, Interrupt>;

struct Interp<'a> {
    source: &'a str,
    allow: &'a AllowList,
    bindings: &'a Bindings,
    limits: &'a SandboxLimits,
    cancel: &'a CancelToken,
    deadline: Instant,
    ops: u64,
    imported: BTreeSet<String>,
    locals: BTreeMap<String, Value>,
    /// Lambda parameter scopes, innermost last.
    params: Vec<(String, Value)>,
}

impl<'a> Interp<'a> {
    fn run(&mut self, program: &lang::Program) -> EvalResult {
        for stmt in &program.stmts {
            self.poll(stmt.span)?;
            self.tick(stmt.span)?;
            match &stmt.kind {
                StmtKind::Use { module, .. } => {
                    self.imported.insert(module.clone());
                }
                StmtKind::Let { name, value } => {
                    let value = self.eval(value)?;
                    self.locals.insert(name.clone(), value);
                }
            }
        }
        // Last poll so a run that blew past the deadline cannot still
        // report success.
        let end_span = program
            .stmts
            .last()
            .map(|stmt| stmt.span)
            .unwrap_or(Span::new(0, 0));
        self.poll(end_span)?;
        match self.locals.get(lang::RESULT_BINDING) {
            Some(result) => Ok(result.clone()),
            None => Err(Fault::new(
                FaultKind::MissingResult,
                Span::new(0, 0),
                format!(
                    "program completed without binding '{}'",
                    lang::RESULT_BINDING
                ),
            )),
        }
    }

    /// Charge one operation against the budget.
    fn tick(&mut self, span: Span) -> Result<(), Interrupt> {
        self.ops += 1;
        if self.ops > self.limits.max_ops {
            return Err(Interrupt::Resource(span));
        }
        if self.ops % POLL_INTERVAL_OPS == 0 {
            self.poll(span)?;
        }
        Ok(())
    }

    /// Check the deadline and the cancel token.
    fn poll(&self, span: Span) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled(span));
        }
        if Instant::now() >= self.deadline {
            return Err(Interrupt::Timeout(span));
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> EvalResult {
        self.tick(expr.span)?;
        match &expr.kind {
            ExprKind::Literal(lit) => Ok(literal_value(lit)),
            ExprKind::Ident(name) => self.lookup(name, expr.span),
            ExprKind::Field { base, name } => {
                let value = self.eval(base)?;
                self.field(value, name, expr.span)
            }
            ExprKind::Index { base, index } => {
                let value = self.eval(base)?;
                let key = self.eval(index)?;
                self.index(value, key, expr.span)
            }
            ExprKind::Call {
                name,
                name_span,
                args,
            } => self.call(name, *name_span, args, expr.span),
            ExprKind::Lambda { .. } => Err(Fault::new(
                FaultKind::WrongType,
                expr.span,
                "a lambda is only valid as an argument to filter, map, or sort_by",
            )),
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                self.unary(*op, value, expr.span)
            }
            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, expr.span),
        }
    }

    fn lookup(&mut self, name: &str, span: Span) -> EvalResult {
        if let Some((_, value)) = self.params.iter().rev().find(|(param, _)| param == name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.locals.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.bindings.get(name) {
            return Ok(value.clone());
        }
        Err(Fault::new(
            FaultKind::UnknownName,
            span,
            format!("name '{name}' is not defined"),
        ))
    }

    fn field(&mut self, value: Value, name: &str, span: Span) -> EvalResult {
        match value {
            Value::Record(map) => map.get(name).cloned().ok_or_else(|| {
                Fault::new(
                    FaultKind::MissingField,
                    span,
                    format!("record has no field '{name}'"),
                )
            }),
            other => Err(Fault::new(
                FaultKind::WrongType,
                span,
                format!("cannot access field '{name}' on {}", other.type_name()),
            )),
        }
    }

    fn index(&mut self, value: Value, key: Value, span: Span) -> EvalResult {
        match (value, key) {
            (Value::List(items), Value::Int(i)) => {
                if i < 0 || i as usize >= items.len() {
                    return Err(Fault::new(
                        FaultKind::IndexOutOfRange,
                        span,
                        format!("index {i} out of range for list of length {}", items.len()),
                    ));
                }
                Ok(items[i as usize].clone())
            }
            (Value::Record(map), Value::Str(key)) => map.get(&key).cloned().ok_or_else(|| {
                Fault::new(
                    FaultKind::MissingField,
                    span,
                    format!("record has no field '{key}'"),
                )
            }),
            (base, key) => Err(Fault::new(
                FaultKind::WrongType,
                span,
                format!(
                    "cannot index {} with {}",
                    base.type_name(),
                    key.type_name()
                ),
            )),
        }
    }

    fn call(&mut self, name: &str, name_span: Span, args: &[Expr], span: Span) -> EvalResult {
        if builtins::LAMBDA_FUNCTIONS.contains(&name) {
            return self.lambda_call(name, args, span);
        }
        if !self.function_available(name) {
            return Err(Fault::new(
                FaultKind::UnknownName,
                name_span,
                format!("function '{name}' is not available here"),
            ));
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        // The budget hook charges helper iteration against the same op
        // counter and poll sites as evaluated expressions.
        let limits = self.limits;
        let deadline = self.deadline;
        let cancel = self.cancel;
        let ops = &mut self.ops;
        let mut budget = move || -> Result<(), BuiltinError> {
            *ops += 1;
            if *ops > limits.max_ops {
                return Err(BuiltinError::interrupted(
                    FaultKind::ResourceExceeded,
                    "operation budget exhausted",
                ));
            }
            if *ops % POLL_INTERVAL_OPS == 0 {
                if cancel.is_cancelled() {
                    return Err(BuiltinError::interrupted(
                        FaultKind::Cancelled,
                        "execution cancelled",
                    ));
                }
                if Instant::now() >= deadline {
                    return Err(BuiltinError::interrupted(
                        FaultKind::Timeout,
                        "deadline exceeded",
                    ));
                }
            }
            Ok(())
        };
        let result = builtins::call(name, &values, &mut budget);
        drop(budget);
        result.map_err(|err| self.builtin_fault(err, span))
    }

    fn function_available(&self, name: &str) -> bool {
        if builtins::CORE_FUNCTIONS.contains(&name) {
            return true;
        }
        self.imported.iter().any(|module| {
            self.allow.allows_module(module)
                && builtins::module_functions(module)
                    .map(|fns| fns.contains(&name))
                    .unwrap_or(false)
        })
    }

    fn lambda_call(&mut self, name: &str, args: &[Expr], span: Span) -> EvalResult {
        if args.len() != 2 {
            return Err(Fault::new(
                FaultKind::WrongType,
                span,
                format!("{name} expects a list and a lambda"),
            ));
        }
        let items = match self.eval(&args[0])? {
            Value::List(items) => items,
            other => {
                return Err(Fault::new(
                    FaultKind::WrongType,
                    args[0].span,
                    format!("{name} expects a list, got {}", other.type_name()),
                ))
            }
        };
        let ExprKind::Lambda { param, body } = &args[1].kind else {
            return Err(Fault::new(
                FaultKind::WrongType,
                args[1].span,
                format!("{name} expects a lambda like |r| ... as its second argument"),
            ));
        };

        match name {
            "filter" => {
                let mut kept = Vec::new();
                for item in items {
                    self.tick(body.span)?;
                    let verdict = self.apply(param, item.clone(), body)?;
                    match verdict {
                        Value::Bool(true) => kept.push(item),
                        Value::Bool(false) => {}
                        other => {
                            return Err(Fault::new(
                                FaultKind::WrongType,
                                body.span,
                                format!(
                                    "filter predicate must return bool, got {}",
                                    other.type_name()
                                ),
                            ))
                        }
                    }
                }
                Ok(Value::List(kept))
            }
            "map" => {
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    self.tick(body.span)?;
                    mapped.push(self.apply(param, item, body)?);
                }
                Ok(Value::List(mapped))
            }
            "sort_by" => {
                let mut keyed = Vec::with_capacity(items.len());
                for item in items {
                    self.tick(body.span)?;
                    let key = self.apply(param, item.clone(), body)?;
                    keyed.push((key, item));
                }
                let mut incomparable = false;
                keyed.sort_by(|(a, _), (b, _)| {
                    builtins::compare(a, b).unwrap_or_else(|| {
                        incomparable = true;
                        std::cmp::Ordering::Equal
                    })
                });
                if incomparable {
                    return Err(Fault::new(
                        FaultKind::WrongType,
                        body.span,
                        "sort_by keys must be of one comparable type",
                    ));
                }
                Ok(Value::List(keyed.into_iter().map(|(_, item)| item).collect()))
            }
            _ => Err(Fault::new(
                FaultKind::UnknownName,
                span,
                format!("no lambda helper named '{name}'"),
            )),
        }
    }

    fn apply(&mut self, param: &str, arg: Value, body: &Expr) -> EvalResult {
        self.params.push((param.to_string(), arg));
        let result = self.eval(body);
        self.params.pop();
        result
    }

    fn unary(&mut self, op: UnaryOp, value: Value, span: Span) -> EvalResult {
        match (op, value) {
            (UnaryOp::Neg, Value::Int(v)) => v.checked_neg().map(Value::Int).ok_or_else(|| {
                Fault::new(FaultKind::InvalidArgument, span, "integer overflow in negation")
            }),
            (UnaryOp::Neg, Value::Float(v)) => Ok(Value::Float(-v)),
            (UnaryOp::Not, Value::Bool(v)) => Ok(Value::Bool(!v)),
            (op, other) => {
                let symbol = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "!",
                };
                Err(Fault::new(
                    FaultKind::WrongType,
                    span,
                    format!("cannot apply '{symbol}' to {}", other.type_name()),
                ))
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr, span: Span) -> EvalResult {
        // && and || short-circuit; everything else is strict.
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let left = self.eval(lhs)?;
            let Value::Bool(left) = left else {
                return Err(Fault::new(
                    FaultKind::WrongType,
                    lhs.span,
                    format!("'{}' expects bool operands, got {}", op.symbol(), left.type_name()),
                ));
            };
            if (op == BinaryOp::And && !left) || (op == BinaryOp::Or && left) {
                return Ok(Value::Bool(left));
            }
            let right = self.eval(rhs)?;
            let Value::Bool(right) = right else {
                return Err(Fault::new(
                    FaultKind::WrongType,
                    rhs.span,
                    format!("'{}' expects bool operands, got {}", op.symbol(), right.type_name()),
                ));
            };
            return Ok(Value::Bool(right));
        }

        let left = self.eval(lhs)?;
        let right = self.eval(rhs)?;
        match op {
            BinaryOp::Add => self.add(left, right, span),
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                self.arithmetic(op, left, right, span)
            }
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordering = builtins::compare(&left, &right).ok_or_else(|| {
                    Fault::new(
                        FaultKind::WrongType,
                        span,
                        format!(
                            "cannot compare {} and {}",
                            left.type_name(),
                            right.type_name()
                        ),
                    )
                })?;
                let verdict = match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    BinaryOp::Ge => ordering.is_ge(),
                    _ => unreachable!("comparison op"),
                };
                Ok(Value::Bool(verdict))
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn add(&mut self, left: Value, right: Value, span: Span) -> EvalResult {
        match (left, right) {
            (Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or_else(|| {
                Fault::new(FaultKind::InvalidArgument, span, "integer overflow in '+'")
            }),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(a as f64 + b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + b as f64)),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
            (a, b) => Err(Fault::new(
                FaultKind::WrongType,
                span,
                format!("cannot add {} and {}", a.type_name(), b.type_name()),
            )),
        }
    }

    fn arithmetic(&mut self, op: BinaryOp, left: Value, right: Value, span: Span) -> EvalResult {
        let zero_division = matches!(op, BinaryOp::Div | BinaryOp::Rem);
        match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                if zero_division && b == 0 {
                    return Err(Fault::new(
                        FaultKind::DivideByZero,
                        span,
                        format!("division by zero in '{}'", op.symbol()),
                    ));
                }
                let result = match op {
                    BinaryOp::Sub => a.checked_sub(b),
                    BinaryOp::Mul => a.checked_mul(b),
                    BinaryOp::Div => a.checked_div(b),
                    BinaryOp::Rem => a.checked_rem(b),
                    _ => unreachable!("arithmetic op"),
                };
                result.map(Value::Int).ok_or_else(|| {
                    Fault::new(
                        FaultKind::InvalidArgument,
                        span,
                        format!("integer overflow in '{}'", op.symbol()),
                    )
                })
            }
            (left, right) => {
                let (a, b) = match (as_f64(&left), as_f64(&right)) {
                    (Some(a), Some(b)) => (a, b),
                    _ => {
                        return Err(Fault::new(
                            FaultKind::WrongType,
                            span,
                            format!(
                                "cannot apply '{}' to {} and {}",
                                op.symbol(),
                                left.type_name(),
                                right.type_name()
                            ),
                        ))
                    }
                };
                if zero_division && b == 0.0 {
                    return Err(Fault::new(
                        FaultKind::DivideByZero,
                        span,
                        format!("division by zero in '{}'", op.symbol()),
                    ));
                }
                let result = match op {
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Rem => a % b,
                    _ => unreachable!("arithmetic op"),
                };
                Ok(Value::Float(result))
            }
        }
    }

    fn builtin_fault(&self, err: BuiltinError, span: Span) -> Interrupt {
        match err.kind {
            FaultKind::Timeout => Interrupt::Timeout(span),
            FaultKind::ResourceExceeded => Interrupt::Resource(span),
            FaultKind::Cancelled => Interrupt::Cancelled(span),
            _ => Fault::new(err.kind, span, err.message),
        }
    }

    fn outcome_for(&self, interrupt: Interrupt) -> ExecutionOutcome {
        match interrupt {
            Interrupt::Fault(fault) => ExecutionOutcome::failure(
                ExecStatus::RuntimeError,
                ErrorDetail {
                    kind: fault.kind,
                    message: fault.message,
                    fragment: self.fragment(fault.span),
                },
            ),
            Interrupt::Timeout(span) => ExecutionOutcome::failure(
                ExecStatus::Timeout,
                ErrorDetail {
                    kind: FaultKind::Timeout,
                    message: format!(
                        "execution exceeded the {} ms deadline",
                        self.limits.timeout_ms
                    ),
                    fragment: self.fragment(span),
                },
            ),
            Interrupt::Resource(span) => ExecutionOutcome::failure(
                ExecStatus::ResourceExceeded,
                ErrorDetail {
                    kind: FaultKind::ResourceExceeded,
                    message: format!(
                        "execution exceeded the budget of {} operations",
                        self.limits.max_ops
                    ),
                    fragment: self.fragment(span),
                },
            ),
            Interrupt::Cancelled(span) => ExecutionOutcome::failure(
                ExecStatus::RuntimeError,
                ErrorDetail {
                    kind: FaultKind::Cancelled,
                    message: "execution cancelled by the caller".to_string(),
                    fragment: self.fragment(span),
                },
            ),
        }
    }

    fn fragment(&self, span: Span) -> Option<String> {
        let text = span.fragment(self.source).trim();
        if text.is_empty() {
            return None;
        }
        let (line, _) = ast::line_col(self.source, span.start);
        let short: String = text.chars().take(MAX_FRAGMENT_CHARS).collect();
        Some(format!("line {line}: {short}"))
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(v) => Value::Bool(*v),
        Literal::Int(v) => Value::Int(*v),
        Literal::Float(v) => Value::Float(*v),
        Literal::Str(v) => Value::Str(v.clone()),
    }
}

/// Equality never faults: numbers compare numerically across int/float,
/// everything else compares structurally, mismatched types are unequal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match builtins::compare(a, b) {
        Some(ordering) => ordering.is_eq(),
        None => a == b,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Int(v) => Some(*v as f64),
        Value::Float(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllowList;

    fn people() -> Bindings {
        let mut bindings = Bindings::new();
        bindings.insert(
            "people",
            Value::List(vec![
                Value::record([("name", Value::from("ada")), ("age", Value::Int(36))]),
                Value::record([("name", Value::from("grace")), ("age", Value::Int(45))]),
                Value::record([("name", Value::from("linus")), ("age", Value::Int(12))]),
            ]),
        );
        bindings
    }

    fn run(source: &str) -> ExecutionOutcome {
        run_with_limits(source, &SandboxLimits::default())
    }

    fn run_with_limits(source: &str, limits: &SandboxLimits) -> ExecutionOutcome {
        let allow = AllowList::default();
        let sandbox = Sandbox::new(&allow);
        sandbox.execute(source, &people(), limits, &CancelToken::new())
    }

    #[test]
    fn filters_maps_and_sorts_over_bindings() {
        let outcome = run(concat!(
            "let adults = filter(people, |r| r.age >= 18);\n",
            "let names = map(adults, |r| r.name);\n",
            "let result = sort(names);\n",
        ));
        assert_eq!(outcome.status, ExecStatus::Success);
        assert_eq!(
            outcome.result,
            Some(Value::List(vec![
                Value::from("ada"),
                Value::from("grace"),
            ]))
        );
    }

    #[test]
    fn missing_result_binding_is_a_runtime_error() {
        let outcome = run("let x = 1;");
        assert_eq!(outcome.status, ExecStatus::RuntimeError);
        let error = outcome.error.expect("error detail");
        assert_eq!(error.kind, FaultKind::MissingResult);
    }

    #[test]
    fn divide_by_zero_reports_the_offending_fragment() {
        let outcome = run("let result = 10 / (1 - 1);");
        assert_eq!(outcome.status, ExecStatus::RuntimeError);
        let error = outcome.error.expect("error detail");
        assert_eq!(error.kind, FaultKind::DivideByZero);
        let fragment = error.fragment.expect("fragment");
        assert!(fragment.starts_with("line 1:"), "fragment: {fragment}");
        assert!(fragment.contains("10 / (1 - 1)"), "fragment: {fragment}");
    }

    #[test]
    fn unknown_name_is_classified() {
        let outcome = run("let result = missing_table;");
        let error = outcome.error.expect("error detail");
        assert_eq!(error.kind, FaultKind::UnknownName);
        assert!(error.message.contains("missing_table"));
    }

    #[test]
    fn missing_field_is_classified() {
        let outcome = run("let result = first(people).salary;");
        let error = outcome.error.expect("error detail");
        assert_eq!(error.kind, FaultKind::MissingField);
        assert!(error.message.contains("salary"));
    }

    #[test]
    fn module_functions_require_their_import() {
        let outcome = run("let result = sum(map(people, |r| r.age));");
        assert_eq!(outcome.status, ExecStatus::RuntimeError);
        assert_eq!(outcome.error.expect("error").kind, FaultKind::UnknownName);

        let outcome = run("use stats;\nlet result = sum(map(people, |r| r.age));");
        assert_eq!(outcome.status, ExecStatus::Success);
        assert_eq!(outcome.result, Some(Value::Int(93)));
    }

    fn numbers(n: i64) -> Bindings {
        let mut bindings = Bindings::new();
        bindings.insert("nums", Value::List((0..n).map(Value::Int).collect()));
        bindings
    }

    #[test]
    fn builtin_iteration_is_charged_per_element() {
        let allow = AllowList::default();
        let sandbox = Sandbox::new(&allow);
        let limits = SandboxLimits {
            timeout_ms: 5_000,
            max_ops: 50,
        };
        let outcome = sandbox.execute(
            "use stats;\nlet result = sum(nums);",
            &numbers(100),
            &limits,
            &CancelToken::new(),
        );
        assert_eq!(outcome.status, ExecStatus::ResourceExceeded);
        assert!(outcome.result.is_none());
    }

    #[test]
    fn quadratic_distinct_cannot_run_unbounded() {
        let allow = AllowList::default();
        let sandbox = Sandbox::new(&allow);
        let limits = SandboxLimits {
            timeout_ms: 5_000,
            max_ops: 100_000,
        };
        let outcome = sandbox.execute(
            "let result = distinct(nums);",
            &numbers(5_000),
            &limits,
            &CancelToken::new(),
        );
        assert_eq!(outcome.status, ExecStatus::ResourceExceeded);
    }

    #[test]
    fn op_budget_yields_resource_exceeded() {
        let limits = SandboxLimits {
            timeout_ms: 5_000,
            max_ops: 10,
        };
        let outcome = run_with_limits(
            "let result = map(people, |r| r.age + 1);",
            &limits,
        );
        assert_eq!(outcome.status, ExecStatus::ResourceExceeded);
        assert!(outcome.result.is_none());
    }

    #[test]
    fn expired_deadline_yields_timeout() {
        let limits = SandboxLimits {
            timeout_ms: 0,
            max_ops: 1_000_000,
        };
        let outcome = run_with_limits("let result = 1;", &limits);
        assert_eq!(outcome.status, ExecStatus::Timeout);
        assert!(outcome.result.is_none());
    }

    #[test]
    fn cancelled_token_aborts_without_result() {
        let allow = AllowList::default();
        let sandbox = Sandbox::new(&allow);
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = sandbox.execute(
            "let result = 1;",
            &people(),
            &SandboxLimits::default(),
            &cancel,
        );
        assert_eq!(outcome.status, ExecStatus::RuntimeError);
        assert_eq!(outcome.error.expect("error").kind, FaultKind::Cancelled);
        assert!(outcome.result.is_none());
    }

    #[test]
    fn replay_is_deterministic() {
        let source = concat!(
            "use stats;\n",
            "let ages = map(sort_by(people, |r| r.name), |r| r.age);\n",
            "let result = avg(ages);\n",
        );
        let first = run(source);
        let second = run(source);
        assert_eq!(first, second);
        assert_eq!(first.status, ExecStatus::Success);
    }

    #[test]
    fn short_circuit_skips_the_right_operand() {
        let outcome = run("let result = false && (1 / 0 == 0);");
        assert_eq!(outcome.status, ExecStatus::Success);
        assert_eq!(outcome.result, Some(Value::Bool(false)));
    }

    #[test]
    fn equality_spans_int_and_float() {
        let outcome = run("let result = 1 == 1.0;");
        assert_eq!(outcome.result, Some(Value::Bool(true)));
        let outcome = run("let result = \"1\" == 1;");
        assert_eq!(outcome.result, Some(Value::Bool(false)));
    }

    #[test]
    fn indexing_checks_bounds() {
        let outcome = run("let result = people[9];");
        assert_eq!(outcome.error.expect("error").kind, FaultKind::IndexOutOfRange);
    }
}

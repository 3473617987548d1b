//! Static validation of candidate programs before any execution.
//!
//! Validation parses the program and walks the tree without evaluating it.
//! It rejects programs that do not parse, programs that reach for withheld
//! capabilities (filesystem, network, process state, dynamic evaluation),
//! and programs that reference names outside the exposed bindings and the
//! allow-listed helper surface. A rejected program is never executed.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::config::AllowList;
use crate::lang::{self, ast, Expr, ExprKind, StmtKind};
use crate::sandbox::builtins;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    SyntaxError,
    ForbiddenConstruct,
}

/// One reason a program was rejected, located in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// 1-based.
    pub line: u32,
    /// 1-based.
    pub column: u32,
    pub message: String,
}

/// Verdict of one validation pass.
///
/// `accepted` is true iff `violations` is empty. Violations are reported in
/// source order so repair prompts read top to bottom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub accepted: bool,
    pub violations: Vec<Violation>,
}

impl ValidationOutcome {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            accepted: violations.is_empty(),
            violations,
        }
    }
}

/// Walks candidate programs against the allow-list and the exposed bindings.
pub struct Validator<'a> {
    allow: &'a AllowList,
}

impl<'a> Validator<'a> {
    pub fn new(allow: &'a AllowList) -> Self {
        Self { allow }
    }

    #[instrument(skip_all, fields(source_len = source.len()))]
    pub fn validate(&self, source: &str, binding_names: &[&str]) -> ValidationOutcome {
        let program = match lang::parse(source) {
            Ok(program) => program,
            Err(err) => {
                let (line, column) = ast::line_col(source, err.offset);
                let outcome = ValidationOutcome::from_violations(vec![Violation {
                    kind: ViolationKind::SyntaxError,
                    line,
                    column,
                    message: err.message,
                }]);
                debug!(line, column, "rejected: syntax error");
                return outcome;
            }
        };

        let mut walk = Walk {
            source,
            allow: self.allow,
            bindings: binding_names,
            imported: BTreeSet::new(),
            locals: BTreeSet::new(),
            params: Vec::new(),
            violations: Vec::new(),
        };
        walk.program(&program);
        let outcome = ValidationOutcome::from_violations(walk.violations);
        debug!(
            accepted = outcome.accepted,
            violations = outcome.violations.len(),
            "validation finished"
        );
        outcome
    }
}

struct Walk<'a> {
    source: &'a str,
    allow: &'a AllowList,
    bindings: &'a [&'a str],
    /// Modules imported so far, allowed ones only.
    imported: BTreeSet<&'a str>,
    locals: BTreeSet<String>,
    params: Vec<String>,
    violations: Vec<Violation>,
}

impl<'a> Walk<'a> {
    fn program(&mut self, program: &'a lang::Program) {
        for stmt in &program.stmts {
            match &stmt.kind {
                StmtKind::Use {
                    module,
                    module_span,
                } => {
                    if !builtins::is_known_module(module) {
                        self.flag(
                            module_span.start,
                            format!("unknown helper module '{module}'"),
                        );
                    } else if !self.allow.allows_module(module) {
                        self.flag(
                            module_span.start,
                            format!("helper module '{module}' is not permitted"),
                        );
                    } else {
                        self.imported.insert(module.as_str());
                    }
                }
                StmtKind::Let { name, value } => {
                    if name.starts_with("__") {
                        self.flag(
                            stmt.span.start,
                            format!("binding reserved name '{name}' is not permitted"),
                        );
                    }
                    // The right-hand side is checked before the name enters
                    // scope, so `let x = x + 1;` on a fresh name is flagged.
                    self.expr(value);
                    self.locals.insert(name.clone());
                }
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Literal(_) => {}
            ExprKind::Ident(name) => self.ident(name, expr.span.start),
            ExprKind::Field { base, name } => {
                if name.starts_with("__") {
                    self.flag(
                        expr.span.start,
                        format!("access to reserved field '{name}' is not permitted"),
                    );
                }
                self.expr(base);
            }
            ExprKind::Index { base, index } => {
                self.expr(base);
                self.expr(index);
            }
            ExprKind::Call {
                name,
                name_span,
                args,
            } => {
                self.call(name, name_span.start);
                for arg in args {
                    self.expr(arg);
                }
            }
            ExprKind::Lambda { param, body } => {
                if param.starts_with("__") {
                    self.flag(
                        expr.span.start,
                        format!("binding reserved name '{param}' is not permitted"),
                    );
                }
                self.params.push(param.clone());
                self.expr(body);
                self.params.pop();
            }
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
        }
    }

    fn ident(&mut self, name: &str, offset: usize) {
        if name.starts_with("__") {
            self.flag(
                offset,
                format!("reference to reserved name '{name}' is not permitted"),
            );
            return;
        }
        let known = self.params.iter().any(|p| p == name)
            || self.locals.contains(name)
            || self.bindings.contains(&name);
        if !known {
            self.flag(offset, format!("reference to non-exposed name '{name}'"));
        }
    }

    fn call(&mut self, name: &str, offset: usize) {
        if let Some(reason) = builtins::forbidden_reason(name) {
            self.flag(
                offset,
                format!("call to '{name}' ({reason}) is not permitted"),
            );
            return;
        }
        if builtins::CORE_FUNCTIONS.contains(&name) {
            return;
        }
        if self
            .imported
            .iter()
            .any(|m| builtins::module_functions(m).is_some_and(|fns| fns.contains(&name)))
        {
            return;
        }
        // Distinguish a missing import from a name that resolves nowhere.
        let home = builtins::KNOWN_MODULES
            .iter()
            .find(|m| builtins::module_functions(m).is_some_and(|fns| fns.contains(&name)));
        match home {
            Some(module) if self.allow.allows_module(module) => self.flag(
                offset,
                format!("function '{name}' requires 'use {module};'"),
            ),
            Some(module) => self.flag(
                offset,
                format!("function '{name}' belongs to module '{module}', which is not permitted"),
            ),
            None => self.flag(offset, format!("call to unknown function '{name}'")),
        }
    }

    fn flag(&mut self, offset: usize, message: String) {
        let (line, column) = ast::line_col(self.source, offset);
        self.violations.push(Violation {
            kind: ViolationKind::ForbiddenConstruct,
            line,
            column,
            message,
        });
    }
}

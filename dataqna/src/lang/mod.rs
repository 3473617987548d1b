//! Grammar for candidate query-script programs.
//!
//! Candidate programs arrive as untrusted text from the synthesis and repair
//! collaborators. This module owns the surface syntax: [`ast`] defines the
//! span-carrying tree and [`parser`] turns source text into it. Nothing here
//! evaluates anything; the validator walks the tree and the sandbox interprets
//! it.

pub mod ast;
pub mod parser;

pub use ast::{BinaryOp, Expr, ExprKind, Literal, Program, Span, Stmt, StmtKind, UnaryOp};
pub use parser::{parse, ParseError};

/// Name of the binding a program must produce to be considered complete.
pub const RESULT_BINDING: &str = "result";

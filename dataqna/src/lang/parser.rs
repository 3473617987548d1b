//! nom parser for the query-script grammar.
//!
//! Parsing never executes anything; it only builds the span-carrying AST that
//! the validator inspects and the sandbox interprets. Errors carry the byte
//! offset of the failure so the validator can report line/column positions.

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, tag},
    character::complete::{alpha1, alphanumeric1, char, digit1, none_of},
    combinator::{map, opt, recognize, value},
    error::{ContextError, ErrorKind, ParseError as NomParseError, VerboseError, VerboseErrorKind},
    multi::{many0_count, separated_list0},
    sequence::{delimited, pair},
    IResult,
};

use crate::lang::ast::{
    BinaryOp, Expr, ExprKind, Literal, Program, Span, Stmt, StmtKind, UnaryOp,
};

type In<'a> = &'a str;
type PResult<'a, T> = IResult<In<'a>, T, VerboseError<In<'a>>>;

/// Parse failure with the byte offset where parsing stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

/// Parse a complete query-script program.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let mut stmts = Vec::new();
    let mut rest = source;
    loop {
        rest = skip_ws(rest);
        if rest.is_empty() {
            break;
        }
        match stmt(source, rest) {
            Ok((next, parsed)) => {
                stmts.push(parsed);
                rest = next;
            }
            Err(err) => return Err(convert_error(source, err)),
        }
    }
    Ok(Program { stmts })
}

/// Skip whitespace and `#` line comments.
fn skip_ws(mut input: &str) -> &str {
    loop {
        let trimmed = input.trim_start();
        if let Some(comment) = trimmed.strip_prefix('#') {
            input = match comment.find('\n') {
                Some(pos) => &comment[pos + 1..],
                None => "",
            };
        } else {
            return trimmed;
        }
    }
}

fn ws(input: In<'_>) -> PResult<'_, ()> {
    Ok((skip_ws(input), ()))
}

fn offset_of(full: &str, rest: &str) -> usize {
    full.len() - rest.len()
}

fn fail<'a, T>(input: In<'a>, context: &'static str) -> PResult<'a, T> {
    let base = VerboseError::from_error_kind(input, ErrorKind::Tag);
    Err(nom::Err::Error(VerboseError::add_context(
        input, context, base,
    )))
}

fn identifier(input: In<'_>) -> PResult<'_, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn sym<'a>(token: &'static str) -> impl FnMut(In<'a>) -> PResult<'a, &'a str> {
    move |input| {
        let (input, _) = ws(input)?;
        tag(token)(input)
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

fn stmt<'a>(full: &'a str, input: In<'a>) -> PResult<'a, Stmt> {
    let (input, _) = ws(input)?;
    let start = offset_of(full, input);
    let (after_kw, keyword) = match identifier(input) {
        Ok(ok) => ok,
        Err(_) => return fail(input, "statement (`use` or `let`)"),
    };
    match keyword {
        "use" => use_stmt(full, after_kw, start),
        "let" => let_stmt(full, after_kw, start),
        _ => fail(input, "statement (`use` or `let`)"),
    }
}

fn use_stmt<'a>(full: &'a str, input: In<'a>, start: usize) -> PResult<'a, Stmt> {
    let (input, _) = ws(input)?;
    let module_start = offset_of(full, input);
    let (input, module) = match identifier(input) {
        Ok(ok) => ok,
        Err(_) => return fail(input, "module name"),
    };
    let module_span = Span::new(module_start, module_start + module.len());
    let (input, _) = terminator(input)?;
    let end = offset_of(full, input);
    Ok((
        input,
        Stmt {
            kind: StmtKind::Use {
                module: module.to_string(),
                module_span,
            },
            span: Span::new(start, end),
        },
    ))
}

fn let_stmt<'a>(full: &'a str, input: In<'a>, start: usize) -> PResult<'a, Stmt> {
    let (input, _) = ws(input)?;
    let (input, name) = match identifier(input) {
        Ok(ok) => ok,
        Err(_) => return fail(input, "binding name"),
    };
    let (input, _) = match sym("=")(input) {
        Ok(ok) => ok,
        Err(_) => return fail(input, "'=' after binding name"),
    };
    let (input, expr) = expr(full, input, 0)?;
    let (input, _) = terminator(input)?;
    let end = offset_of(full, input);
    Ok((
        input,
        Stmt {
            kind: StmtKind::Let {
                name: name.to_string(),
                value: expr,
            },
            span: Span::new(start, end),
        },
    ))
}

fn terminator(input: In<'_>) -> PResult<'_, ()> {
    match sym(";")(input) {
        Ok((input, _)) => Ok((input, ())),
        Err(_) => fail(input, "';' at end of statement"),
    }
}

// ---------------------------------------------------------------------------
// Expressions (precedence climbing, loosest to tightest)
// ---------------------------------------------------------------------------

/// Programs arrive from an untrusted collaborator, so expression depth is
/// capped to keep both parse and evaluation recursion bounded.
const MAX_EXPR_DEPTH: usize = 128;

fn expr<'a>(full: &'a str, input: In<'a>, depth: usize) -> PResult<'a, Expr> {
    if depth > MAX_EXPR_DEPTH {
        return fail(input, "expression nesting too deep");
    }
    or_expr(full, input, depth)
}

fn binary_level<'a>(
    full: &'a str,
    input: In<'a>,
    depth: usize,
    ops: &[(&'static str, BinaryOp)],
    next: fn(&'a str, In<'a>, usize) -> PResult<'a, Expr>,
) -> PResult<'a, Expr> {
    let (input, _) = ws(input)?;
    let start = offset_of(full, input);
    let (mut input, mut lhs) = next(full, input, depth)?;
    // Operator chains nest the tree one level per operand, so they count
    // against the depth cap too.
    let mut chain = depth;
    'outer: loop {
        let rest = skip_ws(input);
        for (token, op) in ops {
            if let Some(after_op) = rest.strip_prefix(token) {
                chain += 1;
                if chain > MAX_EXPR_DEPTH {
                    return fail(rest, "expression nesting too deep");
                }
                let (after_rhs, rhs) = next(full, after_op, depth)?;
                let end = offset_of(full, after_rhs);
                lhs = Expr {
                    kind: ExprKind::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    span: Span::new(start, end),
                };
                input = after_rhs;
                continue 'outer;
            }
        }
        return Ok((input, lhs));
    }
}

fn or_expr<'a>(full: &'a str, input: In<'a>, depth: usize) -> PResult<'a, Expr> {
    binary_level(full, input, depth, &[("||", BinaryOp::Or)], and_expr)
}

fn and_expr<'a>(full: &'a str, input: In<'a>, depth: usize) -> PResult<'a, Expr> {
    binary_level(full, input, depth, &[("&&", BinaryOp::And)], cmp_expr)
}

fn cmp_expr<'a>(full: &'a str, input: In<'a>, depth: usize) -> PResult<'a, Expr> {
    // Longest tokens first so `<=` is never split into `<` + `=`.
    binary_level(
        full,
        input,
        depth,
        &[
            ("==", BinaryOp::Eq),
            ("!=", BinaryOp::Ne),
            ("<=", BinaryOp::Le),
            (">=", BinaryOp::Ge),
            ("<", BinaryOp::Lt),
            (">", BinaryOp::Gt),
        ],
        add_expr,
    )
}

fn add_expr<'a>(full: &'a str, input: In<'a>, depth: usize) -> PResult<'a, Expr> {
    binary_level(
        full,
        input,
        depth,
        &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
        mul_expr,
    )
}

fn mul_expr<'a>(full: &'a str, input: In<'a>, depth: usize) -> PResult<'a, Expr> {
    binary_level(
        full,
        input,
        depth,
        &[
            ("*", BinaryOp::Mul),
            ("/", BinaryOp::Div),
            ("%", BinaryOp::Rem),
        ],
        unary_expr,
    )
}

fn unary_expr<'a>(full: &'a str, input: In<'a>, depth: usize) -> PResult<'a, Expr> {
    if depth > MAX_EXPR_DEPTH {
        return fail(input, "expression nesting too deep");
    }
    let (input, _) = ws(input)?;
    let start = offset_of(full, input);
    // `!` must not swallow the `!=` operator token.
    let op = if input.starts_with('-') {
        Some(UnaryOp::Neg)
    } else if input.starts_with('!') && !input.starts_with("!=") {
        Some(UnaryOp::Not)
    } else {
        None
    };
    match op {
        Some(op) => {
            let (input, operand) = unary_expr(full, &input[1..], depth + 1)?;
            let end = offset_of(full, input);
            Ok((
                input,
                Expr {
                    kind: ExprKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    span: Span::new(start, end),
                },
            ))
        }
        None => postfix_expr(full, input, depth),
    }
}

fn postfix_expr<'a>(full: &'a str, input: In<'a>, depth: usize) -> PResult<'a, Expr> {
    let (input, _) = ws(input)?;
    let start = offset_of(full, input);
    let (mut input, mut base) = primary_expr(full, input, depth)?;
    let mut chain = depth;
    loop {
        let rest = skip_ws(input);
        chain += 1;
        if chain > MAX_EXPR_DEPTH && (rest.starts_with('.') || rest.starts_with('[')) {
            return fail(rest, "expression nesting too deep");
        }
        if let Some(after_dot) = rest.strip_prefix('.') {
            let after_dot = skip_ws(after_dot);
            let (after_name, name) = match identifier(after_dot) {
                Ok(ok) => ok,
                Err(_) => return fail(after_dot, "field name after '.'"),
            };
            let end = offset_of(full, after_name);
            base = Expr {
                kind: ExprKind::Field {
                    base: Box::new(base),
                    name: name.to_string(),
                },
                span: Span::new(start, end),
            };
            input = after_name;
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let (after_index, index) = expr(full, after_bracket, depth + 1)?;
            let (after_close, _) = match sym("]")(after_index) {
                Ok(ok) => ok,
                Err(_) => return fail(after_index, "']' after index"),
            };
            let end = offset_of(full, after_close);
            base = Expr {
                kind: ExprKind::Index {
                    base: Box::new(base),
                    index: Box::new(index),
                },
                span: Span::new(start, end),
            };
            input = after_close;
        } else {
            return Ok((input, base));
        }
    }
}

fn primary_expr<'a>(full: &'a str, input: In<'a>, depth: usize) -> PResult<'a, Expr> {
    let (input, _) = ws(input)?;
    let start = offset_of(full, input);

    if input.starts_with('"') {
        let (input, text) = string_literal(input)?;
        let end = offset_of(full, input);
        return Ok((input, spanned(ExprKind::Literal(Literal::Str(text)), start, end)));
    }
    if input.starts_with(|c: char| c.is_ascii_digit()) {
        return number_literal(full, input, start);
    }
    if input.starts_with('(') {
        let (input, inner) = delimited(char('('), |i| expr(full, i, depth + 1), sym(")"))(input)?;
        let end = offset_of(full, input);
        return Ok((input, Expr { span: Span::new(start, end), ..inner }));
    }
    if input.starts_with('|') && !input.starts_with("||") {
        return lambda_expr(full, input, start, depth);
    }

    let (after_name, name) = match identifier(input) {
        Ok(ok) => ok,
        Err(_) => return fail(input, "expression"),
    };
    let end = offset_of(full, after_name);
    match name {
        "true" => return Ok((after_name, spanned(ExprKind::Literal(Literal::Bool(true)), start, end))),
        "false" => {
            return Ok((after_name, spanned(ExprKind::Literal(Literal::Bool(false)), start, end)))
        }
        "null" => return Ok((after_name, spanned(ExprKind::Literal(Literal::Null), start, end))),
        _ => {}
    }

    // A parenthesis after the name makes this a call into the helper surface.
    if skip_ws(after_name).starts_with('(') {
        let (input, _) = sym("(")(after_name)?;
        let (input, args) = separated_list0(sym(","), |i| expr(full, i, depth + 1))(input)?;
        let (input, _) = match sym(")")(input) {
            Ok(ok) => ok,
            Err(_) => return fail(input, "')' after call arguments"),
        };
        let call_end = offset_of(full, input);
        return Ok((
            input,
            spanned(
                ExprKind::Call {
                    name: name.to_string(),
                    name_span: Span::new(start, start + name.len()),
                    args,
                },
                start,
                call_end,
            ),
        ));
    }

    Ok((after_name, spanned(ExprKind::Ident(name.to_string()), start, end)))
}

fn lambda_expr<'a>(full: &'a str, input: In<'a>, start: usize, depth: usize) -> PResult<'a, Expr> {
    let (input, _) = char('|')(input)?;
    let (input, _) = ws(input)?;
    let (input, param) = match identifier(input) {
        Ok(ok) => ok,
        Err(_) => return fail(input, "lambda parameter"),
    };
    let (input, _) = match sym("|")(input) {
        Ok(ok) => ok,
        Err(_) => return fail(input, "'|' after lambda parameter"),
    };
    let (input, body) = expr(full, input, depth + 1)?;
    let end = offset_of(full, input);
    Ok((
        input,
        spanned(
            ExprKind::Lambda {
                param: param.to_string(),
                body: Box::new(body),
            },
            start,
            end,
        ),
    ))
}

fn number_literal<'a>(full: &'a str, input: In<'a>, start: usize) -> PResult<'a, Expr> {
    let (input, text) = recognize(pair(digit1, opt(pair(char('.'), digit1))))(input)?;
    let end = offset_of(full, input);
    let literal = if text.contains('.') {
        match text.parse::<f64>() {
            Ok(v) => Literal::Float(v),
            Err(_) => return fail(input, "numeric literal"),
        }
    } else {
        match text.parse::<i64>() {
            Ok(v) => Literal::Int(v),
            Err(_) => return fail(input, "numeric literal in range"),
        }
    };
    Ok((input, spanned(ExprKind::Literal(literal), start, end)))
}

fn string_literal(input: In<'_>) -> PResult<'_, String> {
    delimited(
        char('"'),
        map(
            opt(escaped_transform(
                none_of("\\\""),
                '\\',
                alt((
                    value('"', char('"')),
                    value('\\', char('\\')),
                    value('\n', char('n')),
                    value('\t', char('t')),
                )),
            )),
            Option::unwrap_or_default,
        ),
        char('"'),
    )(input)
}

fn spanned(kind: ExprKind, start: usize, end: usize) -> Expr {
    Expr {
        kind,
        span: Span::new(start, end),
    }
}

fn convert_error(source: &str, err: nom::Err<VerboseError<In<'_>>>) -> ParseError {
    match err {
        nom::Err::Incomplete(_) => ParseError {
            offset: source.len(),
            message: "unexpected end of input".to_string(),
        },
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let offset = e
                .errors
                .first()
                .map(|(rest, _)| source.len() - rest.len())
                .unwrap_or(0);
            let message = e
                .errors
                .iter()
                .find_map(|(_, kind)| match kind {
                    VerboseErrorKind::Context(ctx) => Some(format!("expected {ctx}")),
                    _ => None,
                })
                .or_else(|| {
                    e.errors.first().map(|(_, kind)| match kind {
                        VerboseErrorKind::Char(c) => format!("expected '{c}'"),
                        _ => "invalid syntax".to_string(),
                    })
                })
                .unwrap_or_else(|| "invalid syntax".to_string());
            ParseError { offset, message }
        }
    }
}

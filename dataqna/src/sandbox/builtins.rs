//! Allow-listed helper surface for candidate programs.
//!
//! The surface is process-wide, read-only data: the core helpers are always
//! in scope, and the `strings`/`dates`/`stats` modules become available once
//! a program imports them with `use`. The validator consults the same tables
//! that the interpreter dispatches on, so a call the validator accepts is a
//! call the sandbox can execute.

use std::cmp::Ordering;

use chrono::{Datelike, NaiveDate};

use crate::sandbox::{FaultKind, Value};

/// Helpers available without any `use` statement.
///
/// Lambda-taking helpers (`filter`, `map`, `sort_by`) are listed here but
/// dispatched inside the interpreter, since they re-enter evaluation.
pub const CORE_FUNCTIONS: &[&str] = &[
    "filter", "map", "sort", "sort_by", "count", "len", "first", "last", "take", "distinct",
    "keys",
];

/// Core helpers that take a lambda argument and are evaluated by the
/// interpreter rather than [`call`].
pub const LAMBDA_FUNCTIONS: &[&str] = &["filter", "map", "sort_by"];

const STRINGS_FUNCTIONS: &[&str] = &[
    "lower",
    "upper",
    "trim",
    "contains",
    "starts_with",
    "ends_with",
    "join",
    "matches",
];

const DATES_FUNCTIONS: &[&str] = &["date", "year", "month", "day"];

const STATS_FUNCTIONS: &[&str] = &["sum", "avg", "min", "max"];

/// All helper modules this build knows how to execute.
pub const KNOWN_MODULES: &[&str] = &["strings", "dates", "stats"];

pub fn module_functions(module: &str) -> Option<&'static [&'static str]> {
    match module {
        "strings" => Some(STRINGS_FUNCTIONS),
        "dates" => Some(DATES_FUNCTIONS),
        "stats" => Some(STATS_FUNCTIONS),
        _ => None,
    }
}

pub fn is_known_module(module: &str) -> bool {
    module_functions(module).is_some()
}

/// Category label for calls the validator must always reject, regardless of
/// whether the name could ever resolve. These mirror the capabilities the
/// original restricted execution environment withheld.
pub fn forbidden_reason(name: &str) -> Option<&'static str> {
    match name {
        "open" | "read" | "write" | "read_file" | "write_file" | "glob" => {
            Some("filesystem access")
        }
        "fetch" | "request" | "http_get" | "http_post" | "connect" => Some("network access"),
        "env" | "getenv" | "args" | "pid" | "cwd" => Some("process or environment introspection"),
        "eval" | "exec" | "compile" | "import" => Some("dynamic code evaluation"),
        "spawn" | "system" | "shell" | "command" => Some("process execution"),
        _ => None,
    }
}

/// Error raised by a helper; the interpreter attaches the call span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinError {
    pub kind: FaultKind,
    pub message: String,
}

impl BuiltinError {
    fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// For budget hooks reporting a limit or cancellation interrupt.
    pub fn interrupted(kind: FaultKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    fn wrong_type(message: impl Into<String>) -> Self {
        Self::new(FaultKind::WrongType, message)
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(FaultKind::InvalidArgument, message)
    }
}

type BResult = Result<Value, BuiltinError>;

/// Per-element cost hook supplied by the interpreter.
///
/// List-consuming helpers invoke it once per element they touch, so the
/// interpreter's operation ceiling and deadline cover helper work the same
/// way they cover evaluated expressions. A returned error aborts the helper.
pub type OpBudget<'a> = &'a mut dyn FnMut() -> Result<(), BuiltinError>;

/// Dispatch a pure (non-lambda) helper call.
///
/// The caller has already checked that `name` is on the allow-listed surface;
/// an unknown name here is an interpreter bug, reported as a fault rather
/// than a panic.
pub fn call(name: &str, args: &[Value], budget: OpBudget<'_>) -> BResult {
    match name {
        "sort" => sort(args, budget),
        "count" | "len" => len(args),
        "first" => first(args),
        "last" => last(args),
        "take" => take(args, budget),
        "distinct" => distinct(args, budget),
        "keys" => keys(args, budget),
        "lower" => map_str(name, args, |s| Value::Str(s.to_lowercase())),
        "upper" => map_str(name, args, |s| Value::Str(s.to_uppercase())),
        "trim" => map_str(name, args, |s| Value::Str(s.trim().to_string())),
        "contains" => str_pair(name, args, |a, b| Value::Bool(a.contains(b))),
        "starts_with" => str_pair(name, args, |a, b| Value::Bool(a.starts_with(b))),
        "ends_with" => str_pair(name, args, |a, b| Value::Bool(a.ends_with(b))),
        "join" => join(args, budget),
        "matches" => matches(args),
        "date" => date_to_days(args),
        "year" => date_part(name, args, |d| d.year() as i64),
        "month" => date_part(name, args, |d| d.month() as i64),
        "day" => date_part(name, args, |d| d.day() as i64),
        "sum" => sum(args, budget),
        "avg" => avg(args, budget),
        "min" => extremum(name, args, Ordering::Less, budget),
        "max" => extremum(name, args, Ordering::Greater, budget),
        _ => Err(BuiltinError::new(
            FaultKind::UnknownName,
            format!("no helper named '{name}'"),
        )),
    }
}

/// Compare two values for sorting and min/max.
///
/// Int and float compare numerically across types; otherwise both sides must
/// share a type. `None` means the values are not comparable.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn expect_arity(name: &str, args: &[Value], arity: usize) -> Result<(), BuiltinError> {
    if args.len() == arity {
        return Ok(());
    }
    Err(BuiltinError::wrong_type(format!(
        "{name} expects {arity} argument(s), got {}",
        args.len()
    )))
}

fn expect_list<'a>(name: &str, value: &'a Value) -> Result<&'a [Value], BuiltinError> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(BuiltinError::wrong_type(format!(
            "{name} expects a list, got {}",
            other.type_name()
        ))),
    }
}

fn expect_str<'a>(name: &str, value: &'a Value) -> Result<&'a str, BuiltinError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(BuiltinError::wrong_type(format!(
            "{name} expects a string, got {}",
            other.type_name()
        ))),
    }
}

fn sort(args: &[Value], budget: OpBudget<'_>) -> BResult {
    expect_arity("sort", args, 1)?;
    let items = expect_list("sort", &args[0])?;
    let mut sorted = Vec::with_capacity(items.len());
    for item in items {
        budget()?;
        sorted.push(item.clone());
    }
    let mut incomparable = false;
    sorted.sort_by(|a, b| {
        compare(a, b).unwrap_or_else(|| {
            incomparable = true;
            Ordering::Equal
        })
    });
    if incomparable {
        return Err(BuiltinError::wrong_type(
            "sort requires values of one comparable type",
        ));
    }
    Ok(Value::List(sorted))
}

fn len(args: &[Value]) -> BResult {
    expect_arity("len", args, 1)?;
    let n = match &args[0] {
        Value::List(items) => items.len(),
        Value::Str(s) => s.chars().count(),
        Value::Record(map) => map.len(),
        other => {
            return Err(BuiltinError::wrong_type(format!(
                "len expects a list, string, or record, got {}",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(n as i64))
}

fn first(args: &[Value]) -> BResult {
    expect_arity("first", args, 1)?;
    let items = expect_list("first", &args[0])?;
    items.first().cloned().ok_or_else(|| {
        BuiltinError::new(FaultKind::IndexOutOfRange, "first called on an empty list")
    })
}

fn last(args: &[Value]) -> BResult {
    expect_arity("last", args, 1)?;
    let items = expect_list("last", &args[0])?;
    items.last().cloned().ok_or_else(|| {
        BuiltinError::new(FaultKind::IndexOutOfRange, "last called on an empty list")
    })
}

fn take(args: &[Value], budget: OpBudget<'_>) -> BResult {
    expect_arity("take", args, 2)?;
    let items = expect_list("take", &args[0])?;
    let Value::Int(n) = &args[1] else {
        return Err(BuiltinError::wrong_type("take expects an int count"));
    };
    if *n < 0 {
        return Err(BuiltinError::invalid("take count must not be negative"));
    }
    let mut taken = Vec::new();
    for item in items.iter().take(*n as usize) {
        budget()?;
        taken.push(item.clone());
    }
    Ok(Value::List(taken))
}

fn distinct(args: &[Value], budget: OpBudget<'_>) -> BResult {
    expect_arity("distinct", args, 1)?;
    let items = expect_list("distinct", &args[0])?;
    let mut seen: Vec<Value> = Vec::new();
    for item in items {
        budget()?;
        let mut duplicate = false;
        for kept in &seen {
            budget()?;
            if kept == item {
                duplicate = true;
                break;
            }
        }
        if !duplicate {
            seen.push(item.clone());
        }
    }
    Ok(Value::List(seen))
}

fn keys(args: &[Value], budget: OpBudget<'_>) -> BResult {
    expect_arity("keys", args, 1)?;
    match &args[0] {
        Value::Record(map) => {
            let mut names = Vec::with_capacity(map.len());
            for key in map.keys() {
                budget()?;
                names.push(Value::Str(key.clone()));
            }
            Ok(Value::List(names))
        }
        other => Err(BuiltinError::wrong_type(format!(
            "keys expects a record, got {}",
            other.type_name()
        ))),
    }
}

fn map_str(name: &str, args: &[Value], f: impl Fn(&str) -> Value) -> BResult {
    expect_arity(name, args, 1)?;
    Ok(f(expect_str(name, &args[0])?))
}

fn str_pair(name: &str, args: &[Value], f: impl Fn(&str, &str) -> Value) -> BResult {
    expect_arity(name, args, 2)?;
    Ok(f(
        expect_str(name, &args[0])?,
        expect_str(name, &args[1])?,
    ))
}

fn join(args: &[Value], budget: OpBudget<'_>) -> BResult {
    expect_arity("join", args, 2)?;
    let items = expect_list("join", &args[0])?;
    let sep = expect_str("join", &args[1])?;
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        budget()?;
        parts.push(expect_str("join", item)?.to_string());
    }
    Ok(Value::Str(parts.join(sep)))
}

fn matches(args: &[Value]) -> BResult {
    expect_arity("matches", args, 2)?;
    let text = expect_str("matches", &args[0])?;
    let pattern = expect_str("matches", &args[1])?;
    let re = regex::Regex::new(pattern)
        .map_err(|err| BuiltinError::invalid(format!("invalid pattern: {err}")))?;
    Ok(Value::Bool(re.is_match(text)))
}

fn parse_date(name: &str, value: &Value) -> Result<NaiveDate, BuiltinError> {
    let text = expect_str(name, value)?;
    // Accept a plain date or the date prefix of an ISO timestamp.
    let date_part = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").map_err(|_| {
        BuiltinError::invalid(format!("{name} expects an ISO date, got '{text}'"))
    })
}

fn date_to_days(args: &[Value]) -> BResult {
    expect_arity("date", args, 1)?;
    let date = parse_date("date", &args[0])?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).ok_or_else(|| {
        BuiltinError::invalid("epoch construction failed")
    })?;
    Ok(Value::Int((date - epoch).num_days()))
}

fn date_part(name: &str, args: &[Value], f: impl Fn(NaiveDate) -> i64) -> BResult {
    expect_arity(name, args, 1)?;
    Ok(Value::Int(f(parse_date(name, &args[0])?)))
}

fn numeric_items<'a>(name: &str, args: &'a [Value]) -> Result<&'a [Value], BuiltinError> {
    expect_arity(name, args, 1)?;
    expect_list(name, &args[0])
}

fn sum(args: &[Value], budget: OpBudget<'_>) -> BResult {
    let items = numeric_items("sum", args)?;
    let mut int_total: i64 = 0;
    let mut float_total: f64 = 0.0;
    let mut saw_float = false;
    for item in items {
        budget()?;
        match item {
            Value::Int(v) => {
                int_total = int_total.checked_add(*v).ok_or_else(|| {
                    BuiltinError::invalid("sum overflowed the integer range")
                })?;
            }
            Value::Float(v) => {
                saw_float = true;
                float_total += v;
            }
            other => {
                return Err(BuiltinError::wrong_type(format!(
                    "sum expects numbers, got {}",
                    other.type_name()
                )))
            }
        }
    }
    if saw_float {
        Ok(Value::Float(float_total + int_total as f64))
    } else {
        Ok(Value::Int(int_total))
    }
}

fn avg(args: &[Value], budget: OpBudget<'_>) -> BResult {
    let items = numeric_items("avg", args)?;
    if items.is_empty() {
        return Err(BuiltinError::invalid("avg called on an empty list"));
    }
    let total = match sum(args, budget)? {
        Value::Int(v) => v as f64,
        Value::Float(v) => v,
        _ => 0.0,
    };
    Ok(Value::Float(total / items.len() as f64))
}

fn extremum(name: &str, args: &[Value], keep: Ordering, budget: OpBudget<'_>) -> BResult {
    let items = numeric_items(name, args)?;
    let mut best: Option<&Value> = None;
    for item in items {
        budget()?;
        match best {
            None => best = Some(item),
            Some(current) => {
                let ordering = compare(item, current).ok_or_else(|| {
                    BuiltinError::wrong_type(format!(
                        "{name} requires values of one comparable type"
                    ))
                })?;
                if ordering == keep {
                    best = Some(item);
                }
            }
        }
    }
    best.cloned()
        .ok_or_else(|| BuiltinError::invalid(format!("{name} called on an empty list")))
}

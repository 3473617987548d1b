//! Sandboxed execution of candidate programs.
//!
//! The sandbox interprets a validated program against a fixed set of
//! read-only [`Bindings`] under explicit [`crate::config::SandboxLimits`].
//! Programs can reach the bindings and the allow-listed helper surface and
//! nothing else: no filesystem, no network, no clock, no randomness. Every
//! run produces a structured [`ExecutionOutcome`], never a panic and never a
//! partial result.

pub mod builtins;
mod interp;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use interp::Sandbox;

/// A value flowing through a candidate program.
///
/// Tables are represented as lists of records. Records use a sorted key map
/// so iteration order is deterministic across runs, which keeps replayed
/// executions byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    /// Build a record from field/value pairs.
    pub fn record<I, K>(fields: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Named, read-only data exposed to candidate programs.
///
/// The ingestion collaborator prepares one immutable snapshot per session
/// before synthesis begins; the sandbox only ever reads from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Bindings {
    values: BTreeMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Binding names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }
}

/// Caller-driven cancellation for an in-flight session.
///
/// The interpreter polls the token on the same path that enforces the
/// wall-clock deadline, so an abandoned question aborts promptly and its
/// partial state is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Terminal classification of one sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Success,
    RuntimeError,
    Timeout,
    ResourceExceeded,
}

/// Fine-grained fault classification carried in [`ErrorDetail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    MissingResult,
    UnknownName,
    WrongType,
    MissingField,
    IndexOutOfRange,
    DivideByZero,
    InvalidArgument,
    Timeout,
    ResourceExceeded,
    Cancelled,
}

/// Structured fault description, forwarded verbatim to the repair stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: FaultKind,
    pub message: String,
    /// Offending source fragment with its line number, when resolvable.
    pub fragment: Option<String>,
}

/// Outcome of executing one candidate program.
///
/// `result` is present iff `status` is `Success`; `error` is present for
/// every non-Success status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecStatus,
    pub result: Option<Value>,
    pub error: Option<ErrorDetail>,
}

impl ExecutionOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            status: ExecStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(status: ExecStatus, error: ErrorDetail) -> Self {
        debug_assert!(status != ExecStatus::Success);
        Self {
            status,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_iterate_sorted() {
        let record = Value::record([("zeta", Value::Int(1)), ("alpha", Value::Int(2))]);
        let Value::Record(map) = record else {
            panic!("expected record");
        };
        let keys: Vec<_> = map.keys().collect();
        assert_eq!(keys, ["alpha", "zeta"]);
    }

    #[test]
    fn bindings_names_are_sorted() {
        let mut bindings = Bindings::new();
        bindings.insert("people", Value::List(Vec::new()));
        bindings.insert("accounts", Value::List(Vec::new()));
        assert_eq!(bindings.names(), ["accounts", "people"]);
    }

    #[test]
    fn cancel_token_propagates_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn values_serialize_to_plain_json() {
        let value = Value::record([
            ("name", Value::from("ada")),
            ("age", Value::Int(36)),
        ]);
        let json = serde_json::to_string(&value).expect("serialize");
        assert_eq!(json, r#"{"age":36,"name":"ada"}"#);
    }
}

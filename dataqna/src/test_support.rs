//! Test-only scripted collaborators and fixtures.

use std::cell::RefCell;
use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::sandbox::{Bindings, Value};
use crate::session::SchemaContext;
use crate::synthesis::{RepairFeedback, Repairer, Synthesizer};

/// A synthesizer that returns one fixed program, or fails outright.
pub struct ScriptedSynthesizer {
    program: Option<String>,
}

impl ScriptedSynthesizer {
    pub fn returning(program: &str) -> Self {
        Self {
            program: Some(program.to_string()),
        }
    }

    pub fn unavailable() -> Self {
        Self { program: None }
    }
}

impl Synthesizer for ScriptedSynthesizer {
    fn synthesize(&self, _question: &str, _schema: &SchemaContext) -> Result<String> {
        self.program
            .clone()
            .ok_or_else(|| anyhow!("synthesis backend unreachable"))
    }
}

/// A repairer that replays a fixed queue of fixes and records every call.
///
/// When the queue runs dry, further calls fail as unavailable.
pub struct ScriptedRepairer {
    fixes: RefCell<VecDeque<String>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedRepairer {
    pub fn with_fixes<I, S>(fixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fixes: RefCell::new(fixes.into_iter().map(Into::into).collect()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self::with_fixes(Vec::<String>::new())
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    /// Feedback summaries seen so far, one per call, in order.
    pub fn feedback_seen(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Repairer for ScriptedRepairer {
    fn repair(
        &self,
        _question: &str,
        _schema: &SchemaContext,
        _source: &str,
        feedback: &RepairFeedback<'_>,
    ) -> Result<String> {
        let summary = match feedback {
            RepairFeedback::Rejected(violations) => format!("rejected:{}", violations.len()),
            RepairFeedback::Failed(detail) => format!("failed:{}", detail.message),
        };
        self.calls.borrow_mut().push(summary);
        self.fixes
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("repair backend unreachable"))
    }
}

/// A small people table, the standard fixture for loop tests.
pub fn people_bindings() -> Bindings {
    let mut bindings = Bindings::new();
    bindings.insert(
        "people",
        Value::List(vec![
            person("ada", 36, "engineering"),
            person("grace", 45, "engineering"),
            person("linus", 12, "support"),
            person("margaret", 52, "engineering"),
        ]),
    );
    bindings
}

fn person(name: &str, age: i64, team: &str) -> Value {
    Value::record([
        ("name", Value::from(name)),
        ("age", Value::Int(age)),
        ("team", Value::from(team)),
    ])
}

/// Schema context matching [`people_bindings`].
pub fn people_schema() -> SchemaContext {
    SchemaContext {
        tables: "people: one record per person".to_string(),
        fields: "people.name: string\npeople.age: int\npeople.team: string".to_string(),
        samples: String::new(),
    }
}

//! Per-question session state: candidate programs, the attempt trace, and
//! the budget that bounds repair.
//!
//! The tracker enforces the session invariants as hard errors: attempt
//! indices are dense from zero, a rejected program never carries an
//! execution, and no attempt lands past the budget. Violating any of these
//! is a programming error in the orchestrator, not a data condition, so it
//! surfaces as `anyhow::Error` rather than as a session outcome.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::LoopConfig;
use crate::sandbox::{ErrorDetail, ExecutionOutcome, Value};
use crate::validate::{ValidationOutcome, Violation};

/// How a candidate program came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Synthesized,
    Repaired,
}

/// One program proposed for the session's question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateProgram {
    /// Position in the session, 0 for the initial synthesis.
    pub index: u32,
    pub origin: Origin,
    pub source: String,
}

/// One full generate/validate/execute cycle.
///
/// `execution` is `None` exactly when validation rejected the program.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub program: CandidateProgram,
    pub validation: ValidationOutcome,
    pub execution: Option<ExecutionOutcome>,
}

/// Append-only record of a session's attempts, capped at the budget.
#[derive(Debug)]
pub struct AttemptTracker {
    max_attempts: u32,
    attempts: Vec<Attempt>,
}

impl AttemptTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: Vec::new(),
        }
    }

    pub fn record(&mut self, attempt: Attempt) -> Result<()> {
        if self.attempts.len() as u32 >= self.max_attempts {
            bail!(
                "attempt budget of {} exhausted, refusing attempt {}",
                self.max_attempts,
                attempt.program.index
            );
        }
        if attempt.program.index as usize != self.attempts.len() {
            bail!(
                "attempt index {} does not follow the trace (expected {})",
                attempt.program.index,
                self.attempts.len()
            );
        }
        if !attempt.validation.accepted && attempt.execution.is_some() {
            bail!(
                "attempt {} was rejected by validation but carries an execution",
                attempt.program.index
            );
        }
        self.attempts.push(attempt);
        Ok(())
    }

    /// Attempts still permitted, the in-flight one excluded.
    pub fn remaining_budget(&self) -> u32 {
        self.max_attempts - self.attempts.len() as u32
    }

    pub fn trace(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn last(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn into_trace(self) -> Vec<Attempt> {
        self.attempts
    }
}

/// Schema hints assembled for the question, passed to both collaborators.
///
/// Each field is a pre-rendered text block: matched tables, matched fields,
/// and similar worked examples, in the order the retriever ranked them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaContext {
    pub tables: String,
    pub fields: String,
    pub samples: String,
}

/// One natural-language question and the context it runs under.
#[derive(Debug, Clone)]
pub struct Session {
    pub question: String,
    pub schema: SchemaContext,
    pub config: LoopConfig,
}

impl Session {
    pub fn new(question: impl Into<String>, schema: SchemaContext, config: LoopConfig) -> Self {
        Self {
            question: question.into(),
            schema,
            config,
        }
    }
}

/// Which collaborator call failed, for unavailability reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorStage {
    Synthesis,
    Repair,
}

/// Why an exhausted session gave up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureDetail {
    /// The final candidate never passed validation.
    Violations { violations: Vec<Violation> },
    /// The final candidate failed in the sandbox.
    Execution { error: ErrorDetail },
    /// A collaborator call failed outright.
    CollaboratorUnavailable {
        stage: CollaboratorStage,
        message: String,
    },
}

/// Terminal state of a session. Once reached, no further attempts occur.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionOutcome {
    Answered { answer: Value },
    Exhausted { failure: FailureDetail },
}

/// Everything a caller gets back: the verdict and the full attempt trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub trace: Vec<Attempt>,
}

impl SessionReport {
    pub fn answer(&self) -> Option<&Value> {
        match &self.outcome {
            SessionOutcome::Answered { answer } => Some(answer),
            SessionOutcome::Exhausted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ExecStatus, FaultKind};

    fn accepted() -> ValidationOutcome {
        ValidationOutcome {
            accepted: true,
            violations: Vec::new(),
        }
    }

    fn rejected() -> ValidationOutcome {
        ValidationOutcome {
            accepted: false,
            violations: vec![Violation {
                kind: crate::validate::ViolationKind::ForbiddenConstruct,
                line: 1,
                column: 1,
                message: "call to 'open' (filesystem access) is not permitted".to_string(),
            }],
        }
    }

    fn attempt(index: u32, origin: Origin, execution: Option<ExecutionOutcome>) -> Attempt {
        Attempt {
            program: CandidateProgram {
                index,
                origin,
                source: "let result = 1;".to_string(),
            },
            validation: accepted(),
            execution,
        }
    }

    #[test]
    fn records_attempts_in_order() {
        let mut tracker = AttemptTracker::new(3);
        tracker
            .record(attempt(
                0,
                Origin::Synthesized,
                Some(ExecutionOutcome::success(Value::Int(1))),
            ))
            .expect("first attempt");
        assert_eq!(tracker.remaining_budget(), 2);
        assert_eq!(tracker.trace().len(), 1);
    }

    #[test]
    fn rejects_out_of_order_index() {
        let mut tracker = AttemptTracker::new(3);
        let err = tracker
            .record(attempt(1, Origin::Synthesized, None))
            .expect_err("index must start at 0");
        assert!(err.to_string().contains("expected 0"));
    }

    #[test]
    fn rejects_attempts_past_the_budget() {
        let mut tracker = AttemptTracker::new(1);
        tracker
            .record(attempt(
                0,
                Origin::Synthesized,
                Some(ExecutionOutcome::failure(
                    ExecStatus::RuntimeError,
                    ErrorDetail {
                        kind: FaultKind::DivideByZero,
                        message: "division by zero in '/'".to_string(),
                        fragment: None,
                    },
                )),
            ))
            .expect("within budget");
        let err = tracker
            .record(attempt(1, Origin::Repaired, None))
            .expect_err("budget exhausted");
        assert!(err.to_string().contains("budget"));
    }

    #[test]
    fn rejected_attempt_must_not_carry_an_execution() {
        let mut tracker = AttemptTracker::new(3);
        let bad = Attempt {
            program: CandidateProgram {
                index: 0,
                origin: Origin::Synthesized,
                source: "let result = open(\"x\");".to_string(),
            },
            validation: rejected(),
            execution: Some(ExecutionOutcome::success(Value::Null)),
        };
        let err = tracker.record(bad).expect_err("invariant breach");
        assert!(err.to_string().contains("rejected"));
    }

    #[test]
    fn report_exposes_the_answer_only_when_answered() {
        let answered = SessionReport {
            outcome: SessionOutcome::Answered {
                answer: Value::Int(42),
            },
            trace: Vec::new(),
        };
        assert_eq!(answered.answer(), Some(&Value::Int(42)));

        let exhausted = SessionReport {
            outcome: SessionOutcome::Exhausted {
                failure: FailureDetail::Violations {
                    violations: rejected().violations,
                },
            },
            trace: Vec::new(),
        };
        assert_eq!(exhausted.answer(), None);
    }
}

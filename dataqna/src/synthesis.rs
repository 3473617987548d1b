//! Collaborator seams for program synthesis and repair.
//!
//! The loop never talks to a model directly; it goes through these traits so
//! production wiring and scripted test doubles are interchangeable. Both
//! calls are fallible in a way that is distinct from producing a bad
//! program: a returned `Err` means the collaborator itself was unavailable
//! and ends the session, while a returned program that fails validation or
//! execution just consumes an attempt.

use anyhow::Result;

use crate::sandbox::ErrorDetail;
use crate::session::SchemaContext;
use crate::validate::Violation;

/// What went wrong with the previous candidate, for the repairer.
#[derive(Debug, Clone, Copy)]
pub enum RepairFeedback<'a> {
    /// Validation rejected the program; it was never executed.
    Rejected(&'a [Violation]),
    /// The sandbox ran the program and it failed.
    Failed(&'a ErrorDetail),
}

/// Produces the initial candidate program for a question.
pub trait Synthesizer {
    fn synthesize(&self, question: &str, schema: &SchemaContext) -> Result<String>;
}

/// Produces a corrected program from a failed candidate and its diagnosis.
pub trait Repairer {
    fn repair(
        &self,
        question: &str,
        schema: &SchemaContext,
        source: &str,
        feedback: &RepairFeedback<'_>,
    ) -> Result<String>;
}

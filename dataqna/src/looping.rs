//! The generate/validate/execute/repair loop.
//!
//! One call to [`run_session`] drives a question to a terminal state: either
//! `Answered` with the value of the first successful execution, or
//! `Exhausted` with the reason the final attempt failed. Each candidate
//! program consumes exactly one attempt from the budget whether it is
//! rejected by validation or fails in the sandbox, and a rejected candidate
//! is never executed.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::sandbox::{Bindings, CancelToken, ExecStatus, ExecutionOutcome, Sandbox};
use crate::session::{
    Attempt, AttemptTracker, CandidateProgram, CollaboratorStage, FailureDetail, Origin, Session,
    SessionOutcome, SessionReport,
};
use crate::synthesis::{RepairFeedback, Repairer, Synthesizer};
use crate::validate::Validator;

#[instrument(skip_all, fields(max_attempts = session.config.max_attempts))]
pub fn run_session<S, R>(
    session: &Session,
    synthesizer: &S,
    repairer: &R,
    bindings: &Bindings,
    cancel: &CancelToken,
) -> Result<SessionReport>
where
    S: Synthesizer,
    R: Repairer,
{
    session.config.validate().context("session config")?;
    let binding_names = bindings.names();
    let validator = Validator::new(&session.config.allow);
    let sandbox = Sandbox::new(&session.config.allow);
    let mut tracker = AttemptTracker::new(session.config.max_attempts);

    let mut source = match synthesizer.synthesize(&session.question, &session.schema) {
        Ok(source) => source,
        Err(err) => {
            warn!(error = %err, "synthesis collaborator unavailable");
            return Ok(exhausted(
                tracker,
                FailureDetail::CollaboratorUnavailable {
                    stage: CollaboratorStage::Synthesis,
                    message: err.to_string(),
                },
            ));
        }
    };
    let mut origin = Origin::Synthesized;
    let mut index = 0u32;

    loop {
        debug!(index, ?origin, "validating candidate");
        let validation = validator.validate(&source, &binding_names);
        let execution = if validation.accepted {
            Some(sandbox.execute(&source, bindings, &session.config.limits, cancel))
        } else {
            None
        };
        tracker.record(Attempt {
            program: CandidateProgram {
                index,
                origin,
                source: source.clone(),
            },
            validation: validation.clone(),
            execution: execution.clone(),
        })?;

        if let Some(outcome) = &execution {
            if outcome.is_success() {
                let answer = outcome
                    .result
                    .clone()
                    .context("successful execution missing result")?;
                info!(index, "session answered");
                return Ok(SessionReport {
                    outcome: SessionOutcome::Answered { answer },
                    trace: tracker.into_trace(),
                });
            }
        }

        let failure = attempt_failure(&validation.violations, execution.as_ref())?;
        if cancel.is_cancelled() {
            info!(index, "session cancelled");
            return Ok(exhausted(tracker, failure));
        }
        if is_limit_fault(execution.as_ref()) && !session.config.repair_limit_faults {
            info!(index, "limit fault with repair disabled, giving up");
            return Ok(exhausted(tracker, failure));
        }
        if tracker.remaining_budget() == 0 {
            info!(index, "attempt budget exhausted");
            return Ok(exhausted(tracker, failure));
        }

        let feedback = match execution.as_ref() {
            Some(outcome) => RepairFeedback::Failed(
                outcome
                    .error
                    .as_ref()
                    .context("failed execution missing error detail")?,
            ),
            None => RepairFeedback::Rejected(&validation.violations),
        };
        debug!(index, "requesting repair");
        source = match repairer.repair(&session.question, &session.schema, &source, &feedback) {
            Ok(source) => source,
            Err(err) => {
                warn!(error = %err, "repair collaborator unavailable");
                return Ok(exhausted(
                    tracker,
                    FailureDetail::CollaboratorUnavailable {
                        stage: CollaboratorStage::Repair,
                        message: err.to_string(),
                    },
                ));
            }
        };
        origin = Origin::Repaired;
        index += 1;
    }
}

fn attempt_failure(
    violations: &[crate::validate::Violation],
    execution: Option<&ExecutionOutcome>,
) -> Result<FailureDetail> {
    match execution {
        Some(outcome) => Ok(FailureDetail::Execution {
            error: outcome
                .error
                .clone()
                .context("failed execution missing error detail")?,
        }),
        None => Ok(FailureDetail::Violations {
            violations: violations.to_vec(),
        }),
    }
}

fn is_limit_fault(execution: Option<&ExecutionOutcome>) -> bool {
    matches!(
        execution.map(|o| o.status),
        Some(ExecStatus::Timeout | ExecStatus::ResourceExceeded)
    )
}

fn exhausted(tracker: AttemptTracker, failure: FailureDetail) -> SessionReport {
    SessionReport {
        outcome: SessionOutcome::Exhausted { failure },
        trace: tracker.into_trace(),
    }
}

//! Loop-level tests for full session lifecycle scenarios.
//!
//! These tests drive `run_session` with scripted collaborators to verify
//! end-to-end behavior: repair after validation rejections and runtime
//! failures, budget enforcement, limit-fault policy, collaborator
//! unavailability, cancellation, and replay determinism.

use dataqna::config::{LoopConfig, SandboxLimits};
use dataqna::looping::run_session;
use dataqna::sandbox::{CancelToken, ExecStatus, FaultKind, Value};
use dataqna::session::{
    CollaboratorStage, FailureDetail, Origin, Session, SessionOutcome,
};
use dataqna::test_support::{
    people_bindings, people_schema, ScriptedRepairer, ScriptedSynthesizer,
};
use dataqna::validate::ViolationKind;

const GOOD_PROGRAM: &str = concat!(
    "let adults = filter(people, |r| r.age >= 18);\n",
    "let result = count(adults);\n",
);
const DIVIDE_BY_ZERO: &str = "let result = 10 / 0;";
const NO_RESULT_BINDING: &str = "let x = 1;";
const MISSING_FIELD: &str = "let result = first(people).salary;";
const FORBIDDEN: &str = "let result = open(\"people.json\");";
const ANSWER_42: &str = "let result = 6 * 7;";

fn session_with(config: LoopConfig) -> Session {
    Session::new("How many adults are there?", people_schema(), config)
}

fn session() -> Session {
    session_with(LoopConfig::default())
}

/// Two runtime failures, then a working repair.
///
/// Sequence:
/// 1. Attempt 0 (synthesized): divide by zero.
/// 2. Attempt 1 (repaired): completes without binding `result`.
/// 3. Attempt 2 (repaired): succeeds with 42.
#[test]
fn repairs_runtime_failures_until_success() {
    let synthesizer = ScriptedSynthesizer::returning(DIVIDE_BY_ZERO);
    let repairer = ScriptedRepairer::with_fixes([NO_RESULT_BINDING, ANSWER_42]);

    let report = run_session(
        &session(),
        &synthesizer,
        &repairer,
        &people_bindings(),
        &CancelToken::new(),
    )
    .expect("run");

    assert_eq!(
        report.outcome,
        SessionOutcome::Answered {
            answer: Value::Int(42)
        }
    );
    assert_eq!(report.trace.len(), 3);
    let origins: Vec<Origin> = report.trace.iter().map(|a| a.program.origin).collect();
    assert_eq!(
        origins,
        [Origin::Synthesized, Origin::Repaired, Origin::Repaired]
    );
    let indices: Vec<u32> = report.trace.iter().map(|a| a.program.index).collect();
    assert_eq!(indices, [0, 1, 2]);

    let seen = repairer.feedback_seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].contains("division by zero"), "saw: {}", seen[0]);
    assert!(seen[1].contains("result"), "saw: {}", seen[1]);
}

/// A forbidden program is rejected without execution and the repairer sees
/// the violations.
#[test]
fn rejected_program_is_never_executed() {
    let synthesizer = ScriptedSynthesizer::returning(FORBIDDEN);
    let repairer = ScriptedRepairer::with_fixes([GOOD_PROGRAM]);

    let report = run_session(
        &session(),
        &synthesizer,
        &repairer,
        &people_bindings(),
        &CancelToken::new(),
    )
    .expect("run");

    assert!(matches!(report.outcome, SessionOutcome::Answered { .. }));
    let first = &report.trace[0];
    assert!(!first.validation.accepted);
    assert!(first.execution.is_none());
    assert_eq!(
        first.validation.violations[0].kind,
        ViolationKind::ForbiddenConstruct
    );
    assert_eq!(repairer.feedback_seen(), ["rejected:1"]);
}

/// With a budget of one, a failing first attempt ends the session before
/// the repairer is ever consulted.
#[test]
fn single_attempt_budget_skips_repair() {
    let config = LoopConfig {
        max_attempts: 1,
        ..LoopConfig::default()
    };
    let synthesizer = ScriptedSynthesizer::returning(DIVIDE_BY_ZERO);
    let repairer = ScriptedRepairer::with_fixes([GOOD_PROGRAM]);

    let report = run_session(
        &session_with(config),
        &synthesizer,
        &repairer,
        &people_bindings(),
        &CancelToken::new(),
    )
    .expect("run");

    assert_eq!(repairer.call_count(), 0);
    assert_eq!(report.trace.len(), 1);
    let SessionOutcome::Exhausted {
        failure: FailureDetail::Execution { error },
    } = report.outcome
    else {
        panic!("expected execution failure, got {:?}", report.outcome);
    };
    assert_eq!(error.kind, FaultKind::DivideByZero);
}

/// Every attempt fails; the report carries the final failure and the full
/// trace.
#[test]
fn exhaustion_reports_the_last_failure() {
    let config = LoopConfig {
        max_attempts: 2,
        ..LoopConfig::default()
    };
    let synthesizer = ScriptedSynthesizer::returning(DIVIDE_BY_ZERO);
    let repairer = ScriptedRepairer::with_fixes([MISSING_FIELD]);

    let report = run_session(
        &session_with(config),
        &synthesizer,
        &repairer,
        &people_bindings(),
        &CancelToken::new(),
    )
    .expect("run");

    assert_eq!(report.trace.len(), 2);
    let SessionOutcome::Exhausted {
        failure: FailureDetail::Execution { error },
    } = report.outcome
    else {
        panic!("expected execution failure");
    };
    assert_eq!(error.kind, FaultKind::MissingField);
}

#[test]
fn unavailable_synthesizer_ends_the_session_with_no_attempts() {
    let synthesizer = ScriptedSynthesizer::unavailable();
    let repairer = ScriptedRepairer::with_fixes([GOOD_PROGRAM]);

    let report = run_session(
        &session(),
        &synthesizer,
        &repairer,
        &people_bindings(),
        &CancelToken::new(),
    )
    .expect("run");

    assert!(report.trace.is_empty());
    assert_eq!(repairer.call_count(), 0);
    let SessionOutcome::Exhausted {
        failure: FailureDetail::CollaboratorUnavailable { stage, .. },
    } = report.outcome
    else {
        panic!("expected collaborator failure");
    };
    assert_eq!(stage, CollaboratorStage::Synthesis);
}

#[test]
fn unavailable_repairer_ends_the_session_after_one_attempt() {
    let synthesizer = ScriptedSynthesizer::returning(DIVIDE_BY_ZERO);
    let repairer = ScriptedRepairer::unavailable();

    let report = run_session(
        &session(),
        &synthesizer,
        &repairer,
        &people_bindings(),
        &CancelToken::new(),
    )
    .expect("run");

    assert_eq!(report.trace.len(), 1);
    let SessionOutcome::Exhausted {
        failure: FailureDetail::CollaboratorUnavailable { stage, .. },
    } = report.outcome
    else {
        panic!("expected collaborator failure");
    };
    assert_eq!(stage, CollaboratorStage::Repair);
}

fn tiny_ops_config(repair_limit_faults: bool) -> LoopConfig {
    LoopConfig {
        repair_limit_faults,
        limits: SandboxLimits {
            timeout_ms: 5_000,
            max_ops: 10,
        },
        ..LoopConfig::default()
    }
}

/// With `repair_limit_faults` off, a resource-exceeded run ends the session
/// even though budget remains.
#[test]
fn limit_fault_with_repair_disabled_gives_up_immediately() {
    let synthesizer = ScriptedSynthesizer::returning(GOOD_PROGRAM);
    let repairer = ScriptedRepairer::with_fixes([GOOD_PROGRAM, GOOD_PROGRAM]);

    let report = run_session(
        &session_with(tiny_ops_config(false)),
        &synthesizer,
        &repairer,
        &people_bindings(),
        &CancelToken::new(),
    )
    .expect("run");

    assert_eq!(repairer.call_count(), 0);
    assert_eq!(report.trace.len(), 1);
    let attempt = &report.trace[0];
    let execution = attempt.execution.as_ref().expect("executed");
    assert_eq!(execution.status, ExecStatus::ResourceExceeded);
    assert!(matches!(
        report.outcome,
        SessionOutcome::Exhausted {
            failure: FailureDetail::Execution { .. }
        }
    ));
}

/// With the default policy, a resource-exceeded run is fed to the repairer
/// like any other failure.
#[test]
fn limit_fault_with_repair_enabled_consults_the_repairer() {
    let synthesizer = ScriptedSynthesizer::returning(GOOD_PROGRAM);
    let repairer = ScriptedRepairer::with_fixes(["let result = count(people);"]);

    let report = run_session(
        &session_with(tiny_ops_config(true)),
        &synthesizer,
        &repairer,
        &people_bindings(),
        &CancelToken::new(),
    )
    .expect("run");

    assert_eq!(repairer.call_count(), 1);
    assert_eq!(
        report.outcome,
        SessionOutcome::Answered {
            answer: Value::Int(4)
        }
    );
}

/// A cancelled token aborts after the in-flight attempt with no repair.
#[test]
fn cancellation_ends_the_session_without_repair() {
    let synthesizer = ScriptedSynthesizer::returning(GOOD_PROGRAM);
    let repairer = ScriptedRepairer::with_fixes([GOOD_PROGRAM]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = run_session(
        &session(),
        &synthesizer,
        &repairer,
        &people_bindings(),
        &cancel,
    )
    .expect("run");

    assert_eq!(repairer.call_count(), 0);
    assert_eq!(report.trace.len(), 1);
    let execution = report.trace[0].execution.as_ref().expect("executed");
    assert_eq!(
        execution.error.as_ref().expect("error").kind,
        FaultKind::Cancelled
    );
    assert!(matches!(report.outcome, SessionOutcome::Exhausted { .. }));
}

/// Replaying a session with identical inputs yields an identical report.
#[test]
fn replay_produces_an_identical_report() {
    let run = || {
        let synthesizer = ScriptedSynthesizer::returning(DIVIDE_BY_ZERO);
        let repairer = ScriptedRepairer::with_fixes([GOOD_PROGRAM]);
        run_session(
            &session(),
            &synthesizer,
            &repairer,
            &people_bindings(),
            &CancelToken::new(),
        )
        .expect("run")
    };
    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert!(matches!(first.outcome, SessionOutcome::Answered { .. }));
}

//! Integration tests for the retry/repair loop

use crate::integration::test_utils::*;
use async_trait::async_trait;
use flowsmith::collaborators::StaticValidator;
use flowsmith::config::{RetryConfig, TimeoutConfig};
use flowsmith::error::{Collaborator, OutcomeStage};
use flowsmith::{
    CancelFlag, CollaboratorError, DeploymentOutcome, DeploymentResult, MemoryError, MemoryStore,
    NextStep, PatternExtractor, RepairContext, RetryOrchestrator, SessionError, SessionOutcome,
    ValidationOutcome, ValidationResult,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        ..RetryConfig::default()
    }
}

#[tokio::test]
async fn deployment_failure_feeds_next_attempt() {
    let store = Arc::new(MemoryStore::new());
    let synthesizer = ScriptedSynthesizer::always(CLEAN_FLOW);
    let deployer = ScriptedDeployer::new(vec![Ok(DeploymentResult::failure(vec![
        component_error(
            "field_integrity_exception",
            "Create_Task: Invalid field Case.Priority_Level__c",
        ),
    ]))]);
    let validator = ScriptedValidator::passing();
    let orchestrator = orchestrator(
        store.clone(),
        synthesizer.clone(),
        deployer.clone(),
        validator.clone(),
    );

    let report = orchestrator
        .run_session("Case_Escalation", "Escalate cases", &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        SessionOutcome::Succeeded { attempt_number: 2 }
    );
    let first = &report.attempts[0];
    assert!(!first.success());
    assert_eq!(first.deployment_outcome, DeploymentOutcome::Failed);
    assert_eq!(first.validation_outcome, ValidationOutcome::NotAttempted);
    assert_eq!(first.deployment_errors.len(), 1);

    // Validation never runs for a failed deployment.
    assert_eq!(validator.calls(), 1);

    let repair = synthesizer.context(1);
    assert_eq!(repair.attempt_number, 2);
    assert_eq!(repair.prior_deployment_errors.len(), 1);
    assert!(repair.prior_validation_errors.is_empty());
    assert_eq!(repair.errors.len(), 1);
    assert!(repair.is_repair());
}

#[tokio::test]
async fn validation_violations_become_failure_patterns() {
    let store = Arc::new(MemoryStore::new());
    let synthesizer = ScriptedSynthesizer::always(LOOP_DML_FLOW);
    let validator = ScriptedValidator::always_failing(
        vec![
            violation("MissingFaultPath", Some("Save_Case")),
            violation("DMLStatementInLoop", Some("Save_Case")),
            violation("UnusedVariable", None),
            violation("FlowDescription", None),
        ],
        1,
    );
    let orchestrator = orchestrator(
        store.clone(),
        synthesizer,
        ScriptedDeployer::succeeding(),
        validator,
    );

    let mut session = orchestrator
        .start_session("Case_Bulk_Update", "Update open cases")
        .unwrap();
    let context = RepairContext::initial(session.memory(), 1, 25);
    let attempt = orchestrator
        .run_attempt(&mut session, &context)
        .await
        .unwrap();

    assert!(!attempt.success());
    assert_eq!(attempt.deployment_outcome, DeploymentOutcome::Succeeded);
    assert_eq!(attempt.validation_outcome, ValidationOutcome::Failed);
    assert_eq!(attempt.validation_errors.len(), 4);
    assert_eq!(session.memory().failure_patterns().len(), 4);
    assert!(session.memory().success_patterns().is_empty());
    assert_eq!(
        RetryOrchestrator::decide_next(&attempt, 1, 3),
        NextStep::Retry
    );
}

#[tokio::test]
async fn clean_validation_stops_with_success() {
    let store = Arc::new(MemoryStore::new());
    let synthesizer = ScriptedSynthesizer::always(CLEAN_FLOW);
    let orchestrator = orchestrator(
        store.clone(),
        synthesizer.clone(),
        ScriptedDeployer::succeeding(),
        ScriptedValidator::passing(),
    );

    let report = orchestrator
        .run_session("Case_Escalation", "Escalate cases", &CancelFlag::new())
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.attempts.len(), 1);
    assert!(report.attempts[0].success());
    assert_eq!(synthesizer.calls(), 1);

    let memory = store.get_memory("Case_Escalation");
    assert!(!memory.success_patterns().is_empty());
    assert!(memory.failure_patterns().is_empty());
    assert!(!store.is_session_active("Case_Escalation"));
}

#[tokio::test]
async fn budget_exhaustion_never_makes_an_extra_attempt() {
    let store = Arc::new(MemoryStore::new());
    let synthesizer = ScriptedSynthesizer::always(LOOP_DML_FLOW);
    let deployer = ScriptedDeployer::succeeding();
    let validator =
        ScriptedValidator::always_failing(vec![violation("DMLStatementInLoop", None)], 10);
    let orchestrator = orchestrator(
        store.clone(),
        synthesizer.clone(),
        deployer.clone(),
        validator.clone(),
    )
    .with_retry_config(retry(3));

    let report = orchestrator
        .run_session("Case_Bulk_Update", "Update open cases", &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Exhausted);
    assert_eq!(synthesizer.calls(), 3);
    assert_eq!(deployer.calls(), 3);
    assert_eq!(validator.calls(), 3);
    assert_eq!(report.attempts.len(), 3);
    assert_eq!(report.attempts_this_session, 3);
    assert!(report.attempts.iter().all(|a| !a.success()));
    // Full history survives exhaustion, remaining errors included.
    let best = report.best_attempt().unwrap();
    assert_eq!(best.attempt_number, 3);
    assert_eq!(best.validation_errors.len(), 1);
}

#[tokio::test]
async fn deployer_transport_failure_halts_session() {
    let store = Arc::new(MemoryStore::new());
    let synthesizer = ScriptedSynthesizer::always(CLEAN_FLOW);
    let deployer = ScriptedDeployer::new(vec![Err(CollaboratorError::Transport(
        "connection reset".to_string(),
    ))]);
    let validator = ScriptedValidator::passing();
    let orchestrator = orchestrator(
        store.clone(),
        synthesizer.clone(),
        deployer,
        validator.clone(),
    );

    let err = orchestrator
        .run_session("Case_Escalation", "Escalate cases", &CancelFlag::new())
        .await
        .unwrap_err();

    match err {
        SessionError::Infrastructure(infra) => {
            assert_eq!(infra.collaborator, Collaborator::Deployer);
            assert_eq!(infra.attempt_number, 1);
        }
        other => panic!("expected infrastructure error, got {other:?}"),
    }
    // No silent retry against transport failures.
    assert_eq!(synthesizer.calls(), 1);
    assert_eq!(validator.calls(), 0);

    // The attempt stays on record, honestly unsuccessful.
    let memory = store.get_memory("Case_Escalation");
    assert_eq!(memory.attempts().len(), 1);
    assert!(!memory.attempts()[0].success());
    assert_eq!(
        memory.attempts()[0].deployment_outcome,
        DeploymentOutcome::NotAttempted
    );
    assert!(!store.is_session_active("Case_Escalation"));
}

#[tokio::test]
async fn synthesis_failure_records_nothing() {
    let store = Arc::new(MemoryStore::new());
    let synthesizer = ScriptedSynthesizer::new(vec![Err(CollaboratorError::Auth(
        "invalid api key".to_string(),
    ))]);
    let deployer = ScriptedDeployer::succeeding();
    let orchestrator = orchestrator(
        store.clone(),
        synthesizer,
        deployer.clone(),
        ScriptedValidator::passing(),
    );

    let err = orchestrator
        .run_session("Case_Escalation", "Escalate cases", &CancelFlag::new())
        .await
        .unwrap_err();

    assert!(err.is_infrastructure());
    assert_eq!(deployer.calls(), 0);
    assert!(store.get_memory("Case_Escalation").attempts().is_empty());
}

#[tokio::test]
async fn slow_deployer_times_out_as_infrastructure_error() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        store,
        ScriptedSynthesizer::always(CLEAN_FLOW),
        ScriptedDeployer::slow(Duration::from_secs(3)),
        ScriptedValidator::passing(),
    )
    .with_timeouts(TimeoutConfig {
        deploy_secs: 1,
        ..TimeoutConfig::default()
    });

    let err = orchestrator
        .run_session("Case_Escalation", "Escalate cases", &CancelFlag::new())
        .await
        .unwrap_err();

    match err {
        SessionError::Infrastructure(infra) => {
            assert_eq!(infra.collaborator, Collaborator::Deployer);
            assert_eq!(infra.source, CollaboratorError::Timeout(Duration::from_secs(1)));
        }
        other => panic!("expected infrastructure error, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_before_start_makes_no_attempt() {
    let synthesizer = ScriptedSynthesizer::always(CLEAN_FLOW);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        synthesizer.clone(),
        ScriptedDeployer::succeeding(),
        ScriptedValidator::passing(),
    );
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = orchestrator
        .run_session("Case_Escalation", "Escalate cases", &cancel)
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert_eq!(synthesizer.calls(), 0);
    assert!(report.attempts.is_empty());
}

/// Fails validation and requests cancellation while the attempt is in flight.
struct CancellingValidator {
    cancel: CancelFlag,
}

#[async_trait]
impl StaticValidator for CancellingValidator {
    async fn validate(&self, _xml: &str) -> Result<ValidationResult, CollaboratorError> {
        self.cancel.cancel();
        Ok(ValidationResult {
            passed: false,
            violations: vec![violation("HardcodedId", None)],
        })
    }
}

#[tokio::test]
async fn cancellation_is_observed_between_attempts() {
    let store = Arc::new(MemoryStore::new());
    let synthesizer = ScriptedSynthesizer::always(CLEAN_FLOW);
    let cancel = CancelFlag::new();
    let orchestrator = RetryOrchestrator::new(
        store.clone(),
        synthesizer.clone(),
        ScriptedDeployer::succeeding(),
        Arc::new(CancellingValidator {
            cancel: cancel.clone(),
        }),
    );

    let report = orchestrator
        .run_session("Case_Escalation", "Escalate cases", &cancel)
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert_eq!(synthesizer.calls(), 1);
    // The in-flight attempt ran to completion.
    assert_eq!(
        report.attempts[0].validation_outcome,
        ValidationOutcome::Failed
    );
}

#[tokio::test]
async fn search_recommendations_reach_the_repair_context() {
    let synthesizer = ScriptedSynthesizer::always(CLEAN_FLOW);
    let deployer = ScriptedDeployer::new(vec![Ok(DeploymentResult::failure(vec![
        component_error("invalid_field", "No such column 'Priority_Level__c'"),
    ]))]);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        synthesizer.clone(),
        deployer,
        ScriptedValidator::passing(),
    )
    .with_search(Arc::new(FixedSearch(Ok(vec![
        "Check the field API name on Case".to_string(),
    ]))));

    orchestrator
        .run_session("Case_Escalation", "Escalate cases", &CancelFlag::new())
        .await
        .unwrap();

    assert!(synthesizer.context(0).recommendations.is_empty());
    assert_eq!(
        synthesizer.context(1).recommendations,
        vec!["Check the field API name on Case".to_string()]
    );
}

#[tokio::test]
async fn failing_search_is_ignored() {
    let synthesizer = ScriptedSynthesizer::always(CLEAN_FLOW);
    let deployer = ScriptedDeployer::new(vec![Ok(DeploymentResult::failure(vec![
        component_error("invalid_field", "No such column"),
    ]))]);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        synthesizer.clone(),
        deployer,
        ScriptedValidator::passing(),
    )
    .with_search(Arc::new(FixedSearch(Err(CollaboratorError::Transport(
        "search offline".to_string(),
    )))));

    let report = orchestrator
        .run_session("Case_Escalation", "Escalate cases", &CancelFlag::new())
        .await
        .unwrap();

    assert!(report.succeeded());
    assert!(synthesizer.context(1).recommendations.is_empty());
}

#[tokio::test]
async fn third_attempt_learns_only_from_validated_success() {
    let store = Arc::new(MemoryStore::new());
    let synthesizer = ScriptedSynthesizer::new(vec![
        Ok(LOOP_DML_FLOW.to_string()),
        Ok(CLEAN_FLOW.to_string()),
    ]);
    let validator = ScriptedValidator::new(vec![
        Ok(ValidationResult {
            passed: false,
            violations: vec![violation("DMLStatementInLoop", Some("Save_Case"))],
        }),
        Ok(ValidationResult::clean()),
    ]);
    let orchestrator = orchestrator(
        store.clone(),
        synthesizer,
        ScriptedDeployer::succeeding(),
        validator,
    );

    let mut session = orchestrator
        .start_session("Case_Router", "Route cases")
        .unwrap();
    let first_context = RepairContext::initial(session.memory(), 1, 25);
    let first = orchestrator
        .run_attempt(&mut session, &first_context)
        .await
        .unwrap();
    let second_context = orchestrator.build_repair_context(session.memory(), &first, 2);
    let second = orchestrator
        .run_attempt(&mut session, &second_context)
        .await
        .unwrap();
    assert!(second.success());

    let third_context = orchestrator.build_repair_context(session.memory(), &second, 3);

    let extractor = PatternExtractor::default();
    let from_second = extractor.describe(CLEAN_FLOW);
    let only_first: BTreeSet<_> = extractor
        .describe(LOOP_DML_FLOW)
        .difference(&from_second)
        .cloned()
        .collect();
    assert!(!only_first.is_empty());

    for pattern in &from_second {
        assert!(third_context.applicable_success_patterns.contains(pattern));
    }
    for pattern in &only_first {
        assert!(!third_context.applicable_success_patterns.contains(pattern));
    }
    assert_eq!(third_context.attempt_number, 3);
    assert!(third_context.errors.is_empty());
    assert_eq!(third_context.applicable_failure_patterns.len(), 1);
}

#[tokio::test]
async fn resumed_session_continues_numbering() {
    let store = Arc::new(MemoryStore::new());
    let validator =
        ScriptedValidator::always_failing(vec![violation("MissingFaultPath", None)], 1);
    let first_synth = ScriptedSynthesizer::always(LOOP_DML_FLOW);
    let orchestrator_one = orchestrator(
        store.clone(),
        first_synth,
        ScriptedDeployer::succeeding(),
        validator,
    )
    .with_retry_config(retry(1));

    let report = orchestrator_one
        .run_session("Case_Router", "Route cases", &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, SessionOutcome::Exhausted);

    let second_synth = ScriptedSynthesizer::always(CLEAN_FLOW);
    let orchestrator_two = orchestrator(
        store.clone(),
        second_synth.clone(),
        ScriptedDeployer::succeeding(),
        ScriptedValidator::passing(),
    )
    .with_retry_config(retry(1));

    let report = orchestrator_two
        .run_session("Case_Router", "Route cases", &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        SessionOutcome::Succeeded { attempt_number: 2 }
    );
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts_this_session, 1);

    let resumed = second_synth.context(0);
    assert_eq!(resumed.attempt_number, 2);
    assert_eq!(resumed.prior_validation_errors.len(), 1);
}

#[tokio::test]
async fn concurrent_session_for_same_flow_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        store.clone(),
        ScriptedSynthesizer::always(CLEAN_FLOW),
        ScriptedDeployer::succeeding(),
        ScriptedValidator::passing(),
    );

    let held = orchestrator
        .start_session("Case_Router", "Route cases")
        .unwrap();
    let err = orchestrator
        .run_session("Case_Router", "Route cases", &CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Integrity(MemoryError::SessionAlreadyActive(_))
    ));

    // Other flows are unaffected.
    assert!(orchestrator
        .run_session("Case_Escalation", "Escalate cases", &CancelFlag::new())
        .await
        .is_ok());

    drop(held);
    assert!(orchestrator
        .run_session("Case_Router", "Route cases", &CancelFlag::new())
        .await
        .is_ok());
}

#[tokio::test]
async fn replaying_an_attempt_number_is_an_integrity_error() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        store.clone(),
        ScriptedSynthesizer::always(CLEAN_FLOW),
        ScriptedDeployer::succeeding(),
        ScriptedValidator::passing(),
    );

    let mut session = orchestrator
        .start_session("Case_Router", "Route cases")
        .unwrap();
    let context = RepairContext::initial(session.memory(), 1, 25);
    orchestrator
        .run_attempt(&mut session, &context)
        .await
        .unwrap();

    let err = orchestrator
        .run_attempt(&mut session, &context)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Integrity(MemoryError::DuplicateAttemptNumber { attempt_number: 1, .. })
    ));

    let err = store
        .update_validation_result(session.lease(), 1, ValidationOutcome::Passed, vec![])
        .unwrap_err();
    assert!(matches!(
        err,
        MemoryError::AlreadyFinalized {
            stage: OutcomeStage::Validation,
            ..
        }
    ));
}

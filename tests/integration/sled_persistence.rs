//! Integration tests for sled-backed attempt persistence

use crate::integration::test_utils::*;
use flowsmith::config::{RetryConfig, StorageConfig};
use flowsmith::memory::{AttemptPersistence, PatternSnapshot, SledAttemptPersistence};
use flowsmith::{
    Attempt, CancelFlag, DeploymentOutcome, MemoryError, MemoryStore, Pattern,
    PatternExtractor, SessionError, SessionOutcome, ValidationOutcome, ValidationResult,
};
use std::sync::Arc;
use tempfile::TempDir;

fn persistent_store(dir: &TempDir) -> (Arc<SledAttemptPersistence>, MemoryStore) {
    let backend = Arc::new(SledAttemptPersistence::open(dir.path().join("memory")).unwrap());
    let store = MemoryStore::new().with_persistence(backend.clone());
    (backend, store)
}

#[test]
fn writes_through_and_hydrates_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let (backend, store) = persistent_store(&dir);
        let (lease, _) = store.start_session("Case_Router").unwrap();
        store
            .record_attempt(&lease, Attempt::pending(1, CLEAN_FLOW))
            .unwrap();
        store
            .update_deployment_result(&lease, 1, DeploymentOutcome::Succeeded, vec![])
            .unwrap();
        store
            .update_validation_result(&lease, 1, ValidationOutcome::Passed, vec![])
            .unwrap();
        store.reconcile_patterns(&lease, 1).unwrap();
        store.flush().unwrap();

        let stored = backend.load_flow("Case_Router").unwrap();
        assert_eq!(stored.attempts.len(), 1);
        assert!(!stored.patterns.success_patterns.is_empty());
    }

    let (_backend, store) = persistent_store(&dir);
    let (_lease, memory) = store.start_session("Case_Router").unwrap();
    assert_eq!(memory.attempts().len(), 1);
    assert!(memory.attempts()[0].success());
    assert_eq!(
        memory.success_patterns(),
        &PatternExtractor::default().describe(CLEAN_FLOW)
    );
    assert_eq!(memory.next_attempt_number(), 2);
}

#[test]
fn unknown_flow_reads_empty_from_persistent_store() {
    let dir = TempDir::new().unwrap();
    let (_backend, store) = persistent_store(&dir);
    let memory = store.get_memory("Never_Seen");
    assert!(memory.is_empty());
}

#[test]
fn stored_gap_blocks_session_and_releases_lease() {
    let dir = TempDir::new().unwrap();
    let (backend, store) = persistent_store(&dir);
    backend
        .put_attempt("Case_Router", &Attempt::pending(1, CLEAN_FLOW))
        .unwrap();
    backend
        .put_attempt("Case_Router", &Attempt::pending(3, CLEAN_FLOW))
        .unwrap();

    let err = store.start_session("Case_Router").unwrap_err();
    assert!(matches!(
        err,
        MemoryError::AttemptNumberGap {
            expected: 2,
            actual: 3,
            ..
        }
    ));
    assert!(!store.is_session_active("Case_Router"));
}

/// Memory written before validation gated success may hold patterns that only
/// ever appeared in failed attempts. The first failure exhibiting them retracts
/// them, and the next repair context no longer carries them.
#[tokio::test]
async fn legacy_false_success_patterns_are_retracted() {
    let dir = TempDir::new().unwrap();
    let (backend, store) = persistent_store(&dir);

    let mut legacy = PatternSnapshot::default();
    legacy.success_patterns.insert(Pattern::DmlInsideLoop);
    legacy.success_patterns.insert(Pattern::AssignmentBeforeLoop);
    backend.put_patterns("Case_Router", &legacy).unwrap();

    let store = Arc::new(store);
    let synthesizer = ScriptedSynthesizer::new(vec![
        Ok(LOOP_DML_FLOW.to_string()),
        Ok(CLEAN_FLOW.to_string()),
    ]);
    let validator = ScriptedValidator::new(vec![Ok(ValidationResult {
        passed: false,
        violations: vec![violation("DMLStatementInLoop", Some("Save_Case"))],
    })]);
    let orchestrator = orchestrator(
        store.clone(),
        synthesizer.clone(),
        ScriptedDeployer::succeeding(),
        validator,
    );

    let report = orchestrator
        .run_session("Case_Router", "Route cases", &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(
        report.outcome,
        SessionOutcome::Succeeded { attempt_number: 2 }
    );

    // The first synthesis still saw the legacy patterns.
    assert!(synthesizer
        .context(0)
        .applicable_success_patterns
        .contains(&Pattern::DmlInsideLoop));
    // After attempt 1 failed they are gone.
    let repair = synthesizer.context(1);
    assert!(!repair
        .applicable_success_patterns
        .contains(&Pattern::DmlInsideLoop));
    assert!(!repair
        .applicable_success_patterns
        .contains(&Pattern::AssignmentBeforeLoop));

    let stored = backend.load_flow("Case_Router").unwrap();
    assert!(!stored.patterns.success_patterns.contains(&Pattern::DmlInsideLoop));
    assert!(stored
        .patterns
        .success_patterns
        .is_superset(&PatternExtractor::default().describe(CLEAN_FLOW)));
}

#[tokio::test]
async fn store_from_config_persists_when_enabled() {
    let dir = TempDir::new().unwrap();
    let storage = StorageConfig {
        persist: true,
        path: dir.path().join("db"),
    };
    let retry = RetryConfig::default();

    {
        let store = Arc::new(MemoryStore::from_config(&retry, &storage).unwrap());
        let orchestrator = orchestrator(
            store.clone(),
            ScriptedSynthesizer::always(CLEAN_FLOW),
            ScriptedDeployer::succeeding(),
            ScriptedValidator::passing(),
        );
        orchestrator
            .run_session("Case_Router", "Route cases", &CancelFlag::new())
            .await
            .unwrap();
        store.flush().unwrap();
    }

    let store = MemoryStore::from_config(&retry, &storage).unwrap();
    let memory = store.get_memory("Case_Router");
    assert_eq!(memory.attempts().len(), 1);
    assert!(memory.attempts()[0].success());
}

#[tokio::test]
async fn session_error_does_not_poison_persistence() {
    let dir = TempDir::new().unwrap();
    let (_backend, store) = persistent_store(&dir);
    let store = Arc::new(store);
    let orchestrator = orchestrator(
        store.clone(),
        ScriptedSynthesizer::always(CLEAN_FLOW),
        ScriptedDeployer::new(vec![Err(flowsmith::CollaboratorError::Auth(
            "expired session".to_string(),
        ))]),
        ScriptedValidator::passing(),
    );

    let err = orchestrator
        .run_session("Case_Router", "Route cases", &CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Infrastructure(_)));

    // The halted attempt is on disk as pending and never successful.
    let memory = store.get_memory("Case_Router");
    assert_eq!(memory.attempts().len(), 1);
    assert_eq!(
        memory.attempts()[0].deployment_outcome,
        DeploymentOutcome::NotAttempted
    );
    assert!(!memory.attempts()[0].success());
}

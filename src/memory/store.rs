//! The single mutation entry point for attempt history.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::attempt::{
    Attempt, DeploymentErrorRecord, DeploymentOutcome, OutcomeEvent, ValidationErrorRecord,
    ValidationOutcome,
};
use crate::config::{RetryConfig, StorageConfig};
use crate::error::{MemoryError, OutcomeStage, StorageError};
use crate::memory::persistence::{AttemptPersistence, SledAttemptPersistence};
use crate::memory::FlowMemory;
use crate::pattern::{PatternDelta, PatternExtractor};

type ActiveSessions = Arc<Mutex<HashSet<String>>>;

/// Authoritative per-flow attempt history.
///
/// Outcomes arrive as [`OutcomeEvent`]s through [`MemoryStore::submit`]; nothing
/// else can change an attempt, and `success` only moves in the validation
/// transition. Every write names its flow through the [`SessionLease`] returned by
/// [`MemoryStore::start_session`], so only the session holding a flow can change it. With a persistence backend attached every change is written through
/// before it becomes visible in memory.
pub struct MemoryStore {
    flows: RwLock<HashMap<String, FlowMemory>>,
    active: ActiveSessions,
    persistence: Option<Arc<dyn AttemptPersistence>>,
    extractor: PatternExtractor,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// In-memory store with the default pattern extractor.
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashSet::new())),
            persistence: None,
            extractor: PatternExtractor::default(),
        }
    }

    /// Store configured from `retry` and `storage`: the extractor threshold, and a
    /// sled backend when persistence is enabled.
    pub fn from_config(retry: &RetryConfig, storage: &StorageConfig) -> Result<Self, StorageError> {
        let mut store = Self::new().with_extractor(PatternExtractor::new(
            retry.min_corroborating_successes,
        ));
        if storage.persist {
            let backend = SledAttemptPersistence::open(&storage.path)?;
            info!(path = %storage.path.display(), "Attempt persistence enabled");
            store = store.with_persistence(Arc::new(backend));
        }
        Ok(store)
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn AttemptPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_extractor(mut self, extractor: PatternExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn extractor(&self) -> &PatternExtractor {
        &self.extractor
    }

    /// Take the single-writer lease for `flow_api_name` and return its memory,
    /// hydrated from persistence the first time the flow is seen.
    pub fn start_session(
        &self,
        flow_api_name: &str,
    ) -> Result<(SessionLease, FlowMemory), MemoryError> {
        {
            let mut active = self.active.lock();
            if !active.insert(flow_api_name.to_string()) {
                return Err(MemoryError::SessionAlreadyActive(flow_api_name.to_string()));
            }
        }
        let lease = SessionLease {
            flow_api_name: flow_api_name.to_string(),
            active: Arc::clone(&self.active),
        };

        // Dropping the lease on the error path releases the lock again.
        let memory = {
            let mut flows = self.flows.write();
            self.loaded(&mut flows, flow_api_name)?.clone()
        };

        info!(
            flow = %flow_api_name,
            attempts = memory.attempts().len(),
            success_patterns = memory.success_patterns().len(),
            failure_patterns = memory.failure_patterns().len(),
            "Session started"
        );
        Ok((lease, memory))
    }

    pub fn is_session_active(&self, flow_api_name: &str) -> bool {
        self.active.lock().contains(flow_api_name)
    }

    /// Append a pending attempt. Numbers must continue the flow's sequence exactly.
    pub fn record_attempt(&self, lease: &SessionLease, attempt: Attempt) -> Result<(), MemoryError> {
        let flow_api_name = self.writer(lease)?;
        let mut flows = self.flows.write();
        let memory = self.loaded(&mut flows, flow_api_name)?;

        let number = attempt.attempt_number;
        if memory.attempt(number).is_some() {
            return Err(MemoryError::DuplicateAttemptNumber {
                flow: flow_api_name.to_string(),
                attempt_number: number,
            });
        }
        let expected = memory.next_attempt_number();
        if number != expected {
            return Err(MemoryError::AttemptNumberGap {
                flow: flow_api_name.to_string(),
                expected,
                actual: number,
            });
        }
        if attempt.deployment_outcome != DeploymentOutcome::NotAttempted
            || attempt.validation_outcome != ValidationOutcome::NotAttempted
        {
            return Err(MemoryError::AttemptNotPending {
                flow: flow_api_name.to_string(),
                attempt_number: number,
            });
        }

        if let Some(persistence) = &self.persistence {
            persistence.put_attempt(flow_api_name, &attempt)?;
        }
        memory.push_attempt(attempt);
        debug!(flow = %flow_api_name, attempt = number, "Attempt recorded");
        Ok(())
    }

    /// Apply one ground-truth outcome to an attempt and return the updated attempt.
    ///
    /// Each outcome is write-once and must be a real result; `NotAttempted` is
    /// rejected. A validation outcome is only accepted once the attempt deployed
    /// successfully.
    pub fn submit(
        &self,
        lease: &SessionLease,
        attempt_number: u32,
        event: OutcomeEvent,
    ) -> Result<Attempt, MemoryError> {
        let flow_api_name = self.writer(lease)?;
        let mut flows = self.flows.write();
        let memory = self.loaded(&mut flows, flow_api_name)?;
        let current = memory
            .attempt(attempt_number)
            .ok_or_else(|| MemoryError::AttemptNotFound {
                flow: flow_api_name.to_string(),
                attempt_number,
            })?;

        let mut updated = current.clone();
        match event {
            OutcomeEvent::Deployment { outcome, errors } => {
                if outcome == DeploymentOutcome::NotAttempted {
                    return Err(MemoryError::InvalidOutcome {
                        flow: flow_api_name.to_string(),
                        attempt_number,
                        stage: OutcomeStage::Deployment,
                    });
                }
                if current.deployment_outcome != DeploymentOutcome::NotAttempted {
                    return Err(MemoryError::AlreadyFinalized {
                        flow: flow_api_name.to_string(),
                        attempt_number,
                        stage: OutcomeStage::Deployment,
                    });
                }
                updated.record_deployment(outcome, errors);
            }
            OutcomeEvent::Validation { outcome, errors } => {
                if outcome == ValidationOutcome::NotAttempted {
                    return Err(MemoryError::InvalidOutcome {
                        flow: flow_api_name.to_string(),
                        attempt_number,
                        stage: OutcomeStage::Validation,
                    });
                }
                if current.validation_outcome != ValidationOutcome::NotAttempted {
                    return Err(MemoryError::AlreadyFinalized {
                        flow: flow_api_name.to_string(),
                        attempt_number,
                        stage: OutcomeStage::Validation,
                    });
                }
                if current.deployment_outcome != DeploymentOutcome::Succeeded {
                    return Err(MemoryError::DeploymentNotSucceeded {
                        flow: flow_api_name.to_string(),
                        attempt_number,
                    });
                }
                updated.record_validation(outcome, errors);
            }
        }

        if let Some(persistence) = &self.persistence {
            persistence.put_attempt(flow_api_name, &updated)?;
        }
        if let Some(slot) = memory.attempt_mut(attempt_number) {
            *slot = updated.clone();
        }
        debug!(
            flow = %flow_api_name,
            attempt = attempt_number,
            deployment = ?updated.deployment_outcome,
            validation = ?updated.validation_outcome,
            success = updated.success(),
            "Outcome recorded"
        );
        Ok(updated)
    }

    pub fn update_deployment_result(
        &self,
        lease: &SessionLease,
        attempt_number: u32,
        outcome: DeploymentOutcome,
        errors: Vec<DeploymentErrorRecord>,
    ) -> Result<Attempt, MemoryError> {
        self.submit(
            lease,
            attempt_number,
            OutcomeEvent::Deployment { outcome, errors },
        )
    }

    /// The only path by which an attempt's `success` reaches its final value.
    pub fn update_validation_result(
        &self,
        lease: &SessionLease,
        attempt_number: u32,
        outcome: ValidationOutcome,
        errors: Vec<ValidationErrorRecord>,
    ) -> Result<Attempt, MemoryError> {
        self.submit(
            lease,
            attempt_number,
            OutcomeEvent::Validation { outcome, errors },
        )
    }

    /// Fold a finalized attempt into the flow's pattern sets.
    pub fn reconcile_patterns(
        &self,
        lease: &SessionLease,
        attempt_number: u32,
    ) -> Result<PatternDelta, MemoryError> {
        let flow_api_name = self.writer(lease)?;
        let mut flows = self.flows.write();
        let memory = self.loaded(&mut flows, flow_api_name)?;
        let attempt = memory
            .attempt(attempt_number)
            .cloned()
            .ok_or_else(|| MemoryError::AttemptNotFound {
                flow: flow_api_name.to_string(),
                attempt_number,
            })?;
        if !attempt.is_finalized() {
            return Err(MemoryError::AttemptNotFinalized {
                flow: flow_api_name.to_string(),
                attempt_number,
            });
        }

        let before = memory.patterns().clone();
        let delta = self.extractor.reconcile(memory, &attempt);
        if delta.is_empty() {
            return Ok(delta);
        }
        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.put_patterns(flow_api_name, memory.patterns()) {
                memory.replace_patterns(before);
                return Err(err.into());
            }
        }

        debug!(
            flow = %flow_api_name,
            attempt = attempt_number,
            added_success = delta.added_success.len(),
            added_failure = delta.added_failure.len(),
            retracted = delta.retracted.len(),
            "Patterns reconciled"
        );
        Ok(delta)
    }

    /// Snapshot of a flow's memory; empty for a flow never seen. Never fails.
    pub fn get_memory(&self, flow_api_name: &str) -> FlowMemory {
        if let Some(memory) = self.flows.read().get(flow_api_name) {
            return memory.clone();
        }
        match self.hydrate(flow_api_name) {
            Ok(memory) => memory,
            Err(err) => {
                warn!(flow = %flow_api_name, error = %err, "Could not read stored memory");
                FlowMemory::empty(flow_api_name)
            }
        }
    }

    pub fn flush(&self) -> Result<(), MemoryError> {
        if let Some(persistence) = &self.persistence {
            persistence.flush()?;
        }
        Ok(())
    }

    /// The flow `lease` grants writes to, provided the lease was issued by this store.
    fn writer<'l>(&self, lease: &'l SessionLease) -> Result<&'l str, MemoryError> {
        if Arc::ptr_eq(&self.active, &lease.active) {
            Ok(&lease.flow_api_name)
        } else {
            Err(MemoryError::ForeignLease(lease.flow_api_name.clone()))
        }
    }

    fn loaded<'a>(
        &self,
        flows: &'a mut HashMap<String, FlowMemory>,
        flow_api_name: &str,
    ) -> Result<&'a mut FlowMemory, MemoryError> {
        if !flows.contains_key(flow_api_name) {
            let memory = self.hydrate(flow_api_name)?;
            flows.insert(flow_api_name.to_string(), memory);
        }
        flows
            .get_mut(flow_api_name)
            .ok_or_else(|| MemoryError::UnknownFlow(flow_api_name.to_string()))
    }

    fn hydrate(&self, flow_api_name: &str) -> Result<FlowMemory, MemoryError> {
        let Some(persistence) = &self.persistence else {
            return Ok(FlowMemory::empty(flow_api_name));
        };
        let stored = persistence.load_flow(flow_api_name)?;
        for (idx, attempt) in stored.attempts.iter().enumerate() {
            let expected = idx as u32 + 1;
            if attempt.attempt_number != expected {
                return Err(MemoryError::AttemptNumberGap {
                    flow: flow_api_name.to_string(),
                    expected,
                    actual: attempt.attempt_number,
                });
            }
        }
        Ok(FlowMemory::from_parts(
            flow_api_name,
            stored.attempts,
            stored.patterns,
        ))
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("flows", &self.flows.read().len())
            .field("active", &self.active.lock().len())
            .field("persistent", &self.persistence.is_some())
            .field("extractor", &self.extractor)
            .finish()
    }
}

/// Exclusive right to mutate one flow's memory. Released on drop.
pub struct SessionLease {
    flow_api_name: String,
    active: ActiveSessions,
}

impl SessionLease {
    pub fn flow_api_name(&self) -> &str {
        &self.flow_api_name
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("flow_api_name", &self.flow_api_name)
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.active.lock().remove(&self.flow_api_name);
        debug!(flow = %self.flow_api_name, "Session lease released");
    }
}

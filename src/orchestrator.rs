//! Retry Orchestrator
//!
//! Drives one flow from requirements to a validated deployment, or to an exhausted
//! retry budget. Each attempt synthesizes XML, records a pending attempt, deploys,
//! validates when the deploy went through, and hands the ground-truth outcome to
//! the memory store. Nothing here ever marks an attempt successful; the store
//! derives that from the validation outcome.

pub mod cancel;
pub mod context;

pub use cancel::CancelFlag;
pub use context::RepairContext;

use crate::attempt::{Attempt, DeploymentOutcome, ValidationOutcome};
use crate::collaborators::{Deployer, FlowSynthesizer, SearchAugmenter, StaticValidator};
use crate::config::{RetryConfig, TimeoutConfig};
use crate::error::{
    Collaborator, CollaboratorError, InfrastructureError, MemoryError, SessionError,
};
use crate::memory::{FlowMemory, MemoryStore, SessionLease};
use futures::future::join_all;
use std::cmp::Reverse;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the loop does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    StopSuccess,
    Retry,
    StopExhausted,
}

/// How a session ended without a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Succeeded { attempt_number: u32 },
    Exhausted,
    Cancelled,
}

/// Result of [`RetryOrchestrator::run_session`]: the outcome plus the flow's full
/// attempt history, so nothing diagnostic is lost on exhaustion.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub flow_api_name: String,
    pub outcome: SessionOutcome,
    pub attempts: Vec<Attempt>,
    pub attempts_this_session: u32,
}

impl SessionReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Succeeded { .. })
    }

    /// The successful attempt if there is one, otherwise the finalized attempt with
    /// the fewest errors (later attempts win ties).
    pub fn best_attempt(&self) -> Option<&Attempt> {
        self.attempts
            .iter()
            .filter(|a| a.is_finalized())
            .max_by_key(|a| (a.success(), Reverse(a.error_count()), a.attempt_number))
    }
}

/// One flow's exclusive session. Holds the store lease until dropped.
#[derive(Debug)]
pub struct FlowSession {
    lease: SessionLease,
    requirements: String,
    memory: FlowMemory,
    attempts_made: u32,
}

impl FlowSession {
    pub fn flow_api_name(&self) -> &str {
        self.lease.flow_api_name()
    }

    /// The store lease every write in this session goes through.
    pub fn lease(&self) -> &SessionLease {
        &self.lease
    }

    pub fn requirements(&self) -> &str {
        &self.requirements
    }

    /// Memory as of the end of the last attempt.
    pub fn memory(&self) -> &FlowMemory {
        &self.memory
    }

    /// Attempts started in this session, including one halted by an
    /// infrastructure error.
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }
}

pub struct RetryOrchestrator {
    store: Arc<MemoryStore>,
    synthesizer: Arc<dyn FlowSynthesizer>,
    deployer: Arc<dyn Deployer>,
    validator: Arc<dyn StaticValidator>,
    search: Option<Arc<dyn SearchAugmenter>>,
    retry: RetryConfig,
    timeouts: TimeoutConfig,
}

impl RetryOrchestrator {
    pub fn new(
        store: Arc<MemoryStore>,
        synthesizer: Arc<dyn FlowSynthesizer>,
        deployer: Arc<dyn Deployer>,
        validator: Arc<dyn StaticValidator>,
    ) -> Self {
        Self {
            store,
            synthesizer,
            deployer,
            validator,
            search: None,
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn with_search(mut self, search: Arc<dyn SearchAugmenter>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Create or resume memory for `flow_api_name`. Fails with
    /// `SessionAlreadyActive` while another session holds the flow.
    pub fn start_session(
        &self,
        flow_api_name: &str,
        requirements: &str,
    ) -> Result<FlowSession, MemoryError> {
        let (lease, memory) = self.store.start_session(flow_api_name)?;
        Ok(FlowSession {
            lease,
            requirements: requirements.to_string(),
            memory,
            attempts_made: 0,
        })
    }

    /// One synthesize/deploy/validate cycle for `context.attempt_number`.
    ///
    /// Deployment and validation failures come back inside the returned attempt. An
    /// infrastructure error leaves the attempt recorded as pending (and therefore
    /// unsuccessful) and is returned as an error.
    pub async fn run_attempt(
        &self,
        session: &mut FlowSession,
        context: &RepairContext,
    ) -> Result<Attempt, SessionError> {
        let result = self.attempt_cycle(session, context).await;
        session.memory = self.store.get_memory(session.flow_api_name());
        result
    }

    async fn attempt_cycle(
        &self,
        session: &mut FlowSession,
        context: &RepairContext,
    ) -> Result<Attempt, SessionError> {
        let flow = session.lease.flow_api_name().to_string();
        let number = context.attempt_number;

        info!(
            flow = %flow,
            attempt = number,
            repairing = context.errors.len(),
            "Synthesizing flow"
        );
        let xml = guarded(
            Collaborator::Synthesizer,
            number,
            self.timeouts.synthesis(),
            self.synthesizer.synthesize(&session.requirements, context),
        )
        .await?;

        self.store
            .record_attempt(&session.lease, Attempt::pending(number, xml.clone()))?;
        session.attempts_made += 1;

        let deployment = guarded(
            Collaborator::Deployer,
            number,
            self.timeouts.deploy(),
            self.deployer.deploy(&flow, &xml),
        )
        .await?;

        let attempt = if !deployment.succeeded {
            warn!(
                flow = %flow,
                attempt = number,
                errors = deployment.component_errors.len(),
                "Deployment failed"
            );
            self.store.update_deployment_result(
                &session.lease,
                number,
                DeploymentOutcome::Failed,
                deployment.component_errors,
            )?
        } else {
            self.store.update_deployment_result(
                &session.lease,
                number,
                DeploymentOutcome::Succeeded,
                Vec::new(),
            )?;

            let validation = guarded(
                Collaborator::Validator,
                number,
                self.timeouts.validate(),
                self.validator.validate(&xml),
            )
            .await?;
            let outcome = if validation.passed {
                ValidationOutcome::Passed
            } else {
                warn!(
                    flow = %flow,
                    attempt = number,
                    violations = validation.violations.len(),
                    "Validation failed"
                );
                ValidationOutcome::Failed
            };
            self.store
                .update_validation_result(&session.lease, number, outcome, validation.violations)?
        };

        let delta = self.store.reconcile_patterns(&session.lease, number)?;
        info!(
            flow = %flow,
            attempt = number,
            success = attempt.success(),
            deployment = ?attempt.deployment_outcome,
            validation = ?attempt.validation_outcome,
            retracted = delta.retracted.len(),
            "Attempt finished"
        );
        Ok(attempt)
    }

    /// Stop on success, stop once `attempt_number` reaches the budget, otherwise
    /// retry.
    pub fn decide_next(attempt: &Attempt, attempt_number: u32, max_attempts: u32) -> NextStep {
        if attempt.success() {
            NextStep::StopSuccess
        } else if attempt_number >= max_attempts {
            NextStep::StopExhausted
        } else {
            NextStep::Retry
        }
    }

    /// Merge the last attempt's errors (deployment first) with the current pattern
    /// sets. Search recommendations are added separately by the session loop.
    pub fn build_repair_context(
        &self,
        memory: &FlowMemory,
        last_attempt: &Attempt,
        next_attempt_number: u32,
    ) -> RepairContext {
        let context = RepairContext::repairing(
            memory,
            last_attempt,
            next_attempt_number,
            self.retry.max_failure_patterns_in_context,
            self.store.extractor(),
        );
        debug!(
            flow = %context.flow_api_name,
            attempt = next_attempt_number,
            errors = context.errors.len(),
            success_patterns = context.applicable_success_patterns.len(),
            failure_patterns = context.applicable_failure_patterns.len(),
            "Repair context built"
        );
        context
    }

    /// Run attempts until success, exhaustion of `max_attempts`, or cancellation.
    ///
    /// Infrastructure and integrity errors halt the session and are returned as
    /// `Err`; the lease is released either way.
    pub async fn run_session(
        &self,
        flow_api_name: &str,
        requirements: &str,
        cancel: &CancelFlag,
    ) -> Result<SessionReport, SessionError> {
        let mut session = self.start_session(flow_api_name, requirements)?;
        let max_attempts = self.retry.max_attempts;

        let mut context = match session.memory.last_attempt().cloned() {
            Some(last) => {
                let next = session.memory.next_attempt_number();
                let mut context = self.build_repair_context(&session.memory, &last, next);
                self.augment(&mut context, &last).await;
                context
            }
            None => RepairContext::initial(
                &session.memory,
                session.memory.next_attempt_number(),
                self.retry.max_failure_patterns_in_context,
            ),
        };

        loop {
            if cancel.is_cancelled() {
                info!(
                    flow = %flow_api_name,
                    attempts = session.attempts_made,
                    "Session cancelled"
                );
                return Ok(report(&session, SessionOutcome::Cancelled));
            }

            let attempt = match self.run_attempt(&mut session, &context).await {
                Ok(attempt) => attempt,
                Err(err) => {
                    error!(flow = %flow_api_name, error = %err, "Session halted");
                    return Err(err);
                }
            };

            match Self::decide_next(&attempt, session.attempts_made, max_attempts) {
                NextStep::StopSuccess => {
                    info!(
                        flow = %flow_api_name,
                        attempt = attempt.attempt_number,
                        "Flow deployed and validated"
                    );
                    return Ok(report(
                        &session,
                        SessionOutcome::Succeeded {
                            attempt_number: attempt.attempt_number,
                        },
                    ));
                }
                NextStep::StopExhausted => {
                    warn!(
                        flow = %flow_api_name,
                        attempts = session.attempts_made,
                        remaining_errors = attempt.error_count(),
                        "Retry budget exhausted"
                    );
                    return Ok(report(&session, SessionOutcome::Exhausted));
                }
                NextStep::Retry => {
                    let next = session.memory.next_attempt_number();
                    context = self.build_repair_context(&session.memory, &attempt, next);
                    self.augment(&mut context, &attempt).await;
                }
            }
        }
    }

    /// Ask the search augmenter about each deployment error. Failures are logged
    /// and skipped.
    async fn augment(&self, context: &mut RepairContext, last_attempt: &Attempt) {
        let Some(search) = &self.search else {
            return;
        };
        if last_attempt.deployment_errors.is_empty() {
            return;
        }

        let limit = self.timeouts.search();
        let lookups = last_attempt
            .deployment_errors
            .iter()
            .map(|e| tokio::time::timeout(limit, search.recommend(e)));
        let results = join_all(lookups).await;

        for (error, result) in last_attempt.deployment_errors.iter().zip(results) {
            match result {
                Ok(Ok(recommendations)) => context.recommendations.extend(recommendations),
                Ok(Err(e)) => {
                    warn!(component = %error.component, kind = %error.kind, error = %e, "Search augmentation failed")
                }
                Err(_) => {
                    warn!(component = %error.component, kind = %error.kind, "Search augmentation timed out")
                }
            }
        }
    }
}

fn report(session: &FlowSession, outcome: SessionOutcome) -> SessionReport {
    SessionReport {
        flow_api_name: session.flow_api_name().to_string(),
        outcome,
        attempts: session.memory.attempts().to_vec(),
        attempts_this_session: session.attempts_made,
    }
}

async fn guarded<T, F>(
    collaborator: Collaborator,
    attempt_number: u32,
    limit: Duration,
    call: F,
) -> Result<T, InfrastructureError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    let source = match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(source)) => source,
        Err(_) => CollaboratorError::Timeout(limit),
    };
    Err(InfrastructureError {
        collaborator,
        attempt_number,
        source,
    })
}

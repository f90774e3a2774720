//! Repair context handed to the synthesizer for the next attempt.

use crate::attempt::{Attempt, DeploymentErrorRecord, RepairError, ValidationErrorRecord};
use crate::memory::FlowMemory;
use crate::pattern::{FailurePattern, Pattern, PatternExtractor};
use serde::Serialize;

/// Computed fresh before every attempt; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairContext {
    pub flow_api_name: String,
    /// The number of the attempt about to be made.
    pub attempt_number: u32,
    pub prior_deployment_errors: Vec<DeploymentErrorRecord>,
    pub prior_validation_errors: Vec<ValidationErrorRecord>,
    /// Deployment errors first, then validation errors, in reported order.
    pub errors: Vec<RepairError>,
    pub applicable_success_patterns: Vec<Pattern>,
    pub applicable_failure_patterns: Vec<FailurePattern>,
    /// Advisory text from search augmentation, if any.
    pub recommendations: Vec<String>,
}

impl RepairContext {
    /// Context with no history at all.
    pub fn empty(flow_api_name: impl Into<String>, attempt_number: u32) -> Self {
        Self {
            flow_api_name: flow_api_name.into(),
            attempt_number,
            ..Self::default()
        }
    }

    /// Context for a flow's first attempt in a session with no previous attempt
    /// to repair; learned patterns still apply.
    pub fn initial(memory: &FlowMemory, attempt_number: u32, max_failure_patterns: usize) -> Self {
        let mut context = Self::empty(memory.flow_api_name(), attempt_number);
        context.applicable_success_patterns = memory.success_patterns().iter().cloned().collect();
        context.applicable_failure_patterns = memory
            .failure_patterns()
            .iter()
            .take(max_failure_patterns)
            .cloned()
            .collect();
        context
    }

    /// Context repairing `last_attempt`.
    ///
    /// Failure patterns that match one of the current errors rank first, then
    /// those the last attempt exhibits, then the rest; ties keep set order.
    pub(crate) fn repairing(
        memory: &FlowMemory,
        last_attempt: &Attempt,
        attempt_number: u32,
        max_failure_patterns: usize,
        extractor: &PatternExtractor,
    ) -> Self {
        let errors = last_attempt.merged_errors();
        let exhibited = extractor.describe(&last_attempt.generated_xml);

        let mut failures: Vec<(u8, &FailurePattern)> = memory
            .failure_patterns()
            .iter()
            .map(|f| {
                let rank = if errors.iter().any(|e| e.same_signature(&f.error)) {
                    0
                } else if exhibited.contains(&f.pattern) {
                    1
                } else {
                    2
                };
                (rank, f)
            })
            .collect();
        failures.sort_by_key(|(rank, _)| *rank);

        Self {
            flow_api_name: memory.flow_api_name().to_string(),
            attempt_number,
            prior_deployment_errors: last_attempt.deployment_errors.clone(),
            prior_validation_errors: last_attempt.validation_errors.clone(),
            errors,
            applicable_success_patterns: memory.success_patterns().iter().cloned().collect(),
            applicable_failure_patterns: failures
                .into_iter()
                .take(max_failure_patterns)
                .map(|(_, f)| f.clone())
                .collect(),
            recommendations: Vec::new(),
        }
    }

    pub fn is_repair(&self) -> bool {
        !self.errors.is_empty()
    }
}

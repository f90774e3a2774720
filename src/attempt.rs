//! Attempt data model
//!
//! An [`Attempt`] is one synthesize/deploy/validate cycle for a single flow. Its
//! `success` flag is derived from the two outcomes and can only be recomputed by
//! the validation transition, so an attempt is never successful before
//! validation has run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of handing the generated metadata to the deployer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOutcome {
    NotAttempted,
    Failed,
    Succeeded,
}

/// Result of running the static validator over a deployed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOutcome {
    NotAttempted,
    Failed,
    Passed,
}

/// One per-component problem reported by the deployer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentErrorRecord {
    pub component: String,
    pub kind: String,
    pub message: String,
}

impl DeploymentErrorRecord {
    pub fn new(
        component: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Rule severity as reported by the static validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Lenient mapping from the labels rule engines commonly emit.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "info" | "note" | "note_level" | "low" => Severity::Info,
            "warning" | "warn" | "medium" => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// One rule violation reported by the static validator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidationErrorRecord {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    /// API name of the offending flow element, when the rule points at one.
    pub element: Option<String>,
}

impl ValidationErrorRecord {
    pub fn new(
        rule_id: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        element: Option<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity,
            message: message.into(),
            element,
        }
    }
}

/// A deployment or validation error, merged into one repair signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairError {
    Deployment(DeploymentErrorRecord),
    Validation(ValidationErrorRecord),
}

impl RepairError {
    /// Whether two errors report the same problem, ignoring message wording.
    pub fn same_signature(&self, other: &RepairError) -> bool {
        match (self, other) {
            (RepairError::Deployment(a), RepairError::Deployment(b)) => {
                a.component == b.component && a.kind == b.kind
            }
            (RepairError::Validation(a), RepairError::Validation(b)) => a.rule_id == b.rule_id,
            _ => false,
        }
    }
}

impl fmt::Display for RepairError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairError::Deployment(e) => {
                write!(f, "[deploy] {} {}: {}", e.component, e.kind, e.message)
            }
            RepairError::Validation(e) => {
                write!(f, "[{}] {}", e.severity, e.rule_id)?;
                if let Some(element) = &e.element {
                    write!(f, " on {}", element)?;
                }
                write!(f, ": {}", e.message)
            }
        }
    }
}

/// Ground-truth outcome submitted to the memory store for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeEvent {
    Deployment {
        outcome: DeploymentOutcome,
        errors: Vec<DeploymentErrorRecord>,
    },
    Validation {
        outcome: ValidationOutcome,
        errors: Vec<ValidationErrorRecord>,
    },
}

/// One synthesis/deploy/validate cycle for a target flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_number: u32,
    pub generated_xml: String,
    /// blake3 digest of `generated_xml`, hex encoded.
    pub xml_digest: String,
    pub deployment_outcome: DeploymentOutcome,
    pub validation_outcome: ValidationOutcome,
    success: bool,
    pub deployment_errors: Vec<DeploymentErrorRecord>,
    pub validation_errors: Vec<ValidationErrorRecord>,
    pub created_at: DateTime<Utc>,
}

impl Attempt {
    /// New attempt with nothing deployed or validated; `success` starts false.
    pub fn pending(attempt_number: u32, generated_xml: impl Into<String>) -> Self {
        let generated_xml = generated_xml.into();
        Self {
            attempt_number,
            xml_digest: xml_digest(&generated_xml),
            generated_xml,
            deployment_outcome: DeploymentOutcome::NotAttempted,
            validation_outcome: ValidationOutcome::NotAttempted,
            success: false,
            deployment_errors: Vec::new(),
            validation_errors: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// True once no further outcome can be recorded for this attempt.
    pub fn is_finalized(&self) -> bool {
        self.deployment_outcome == DeploymentOutcome::Failed
            || self.validation_outcome != ValidationOutcome::NotAttempted
    }

    pub fn error_count(&self) -> usize {
        self.deployment_errors.len() + self.validation_errors.len()
    }

    /// Deployment errors first, then validation errors, each in reported order.
    pub fn merged_errors(&self) -> Vec<RepairError> {
        self.deployment_errors
            .iter()
            .cloned()
            .map(RepairError::Deployment)
            .chain(
                self.validation_errors
                    .iter()
                    .cloned()
                    .map(RepairError::Validation),
            )
            .collect()
    }

    pub(crate) fn record_deployment(
        &mut self,
        outcome: DeploymentOutcome,
        errors: Vec<DeploymentErrorRecord>,
    ) {
        self.deployment_outcome = outcome;
        self.deployment_errors = errors;
        self.success = false;
    }

    pub(crate) fn record_validation(
        &mut self,
        outcome: ValidationOutcome,
        errors: Vec<ValidationErrorRecord>,
    ) {
        self.validation_outcome = outcome;
        self.validation_errors = errors;
        self.success = self.derived_success();
    }

    /// Re-derive `success` from the outcomes. Applied to records read back from
    /// persistence so a stored flag can never outrank the outcomes.
    pub(crate) fn normalize(mut self) -> Self {
        self.success = self.derived_success();
        self
    }

    fn derived_success(&self) -> bool {
        self.deployment_outcome == DeploymentOutcome::Succeeded
            && self.validation_outcome == ValidationOutcome::Passed
    }
}

pub fn xml_digest(xml: &str) -> String {
    hex::encode(blake3::hash(xml.as_bytes()).as_bytes())
}

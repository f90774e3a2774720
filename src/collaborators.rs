//! External Collaborators
//!
//! Interfaces to the systems the retry loop drives: the flow synthesizer, the
//! deployer, the static validator and the optional search augmenter. Each returns
//! `Err(CollaboratorError)` only for transport-level trouble; a rejected deployment
//! or a failed rule check is an `Ok` result carrying structured errors.

use crate::attempt::{DeploymentErrorRecord, Severity, ValidationErrorRecord};
use crate::error::CollaboratorError;
use crate::orchestrator::RepairContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod command_validator;
pub mod provider_synthesizer;

pub use command_validator::CommandValidator;
pub use provider_synthesizer::ProviderSynthesizer;

/// Outcome of one deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub succeeded: bool,
    pub component_errors: Vec<DeploymentErrorRecord>,
}

impl DeploymentResult {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            component_errors: Vec::new(),
        }
    }

    pub fn failure(component_errors: Vec<DeploymentErrorRecord>) -> Self {
        Self {
            succeeded: false,
            component_errors,
        }
    }
}

/// Outcome of one static-analysis run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub violations: Vec<ValidationErrorRecord>,
}

impl ValidationResult {
    pub fn clean() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    /// Fails when any violation is at or above `fail_on`; every violation is kept.
    pub fn from_violations(violations: Vec<ValidationErrorRecord>, fail_on: Severity) -> Self {
        let passed = !violations.iter().any(|v| v.severity >= fail_on);
        Self { passed, violations }
    }
}

/// Produces candidate Flow XML from requirements and repair context
#[async_trait]
pub trait FlowSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        requirements: &str,
        context: &RepairContext,
    ) -> Result<String, CollaboratorError>;
}

/// Uploads a flow definition to the target org
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        flow_api_name: &str,
        xml: &str,
    ) -> Result<DeploymentResult, CollaboratorError>;
}

/// Runs a rules engine over Flow XML
#[async_trait]
pub trait StaticValidator: Send + Sync {
    async fn validate(&self, xml: &str) -> Result<ValidationResult, CollaboratorError>;
}

/// Looks up remediation advice for a deployment error
#[async_trait]
pub trait SearchAugmenter: Send + Sync {
    async fn recommend(
        &self,
        error: &DeploymentErrorRecord,
    ) -> Result<Vec<String>, CollaboratorError>;
}

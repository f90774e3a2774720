//! Flowsmith: Convergent Salesforce Flow Repair
//!
//! Drives generation, deployment and static validation of Salesforce Flow metadata
//! across repeated attempts, learning from each attempt's ground-truth outcome so
//! later attempts repair earlier errors instead of repeating them. An attempt only
//! counts as successful once it has both deployed and passed validation.

pub mod attempt;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod pattern;
pub mod provider;

pub use attempt::{
    Attempt, DeploymentErrorRecord, DeploymentOutcome, OutcomeEvent, RepairError, Severity,
    ValidationErrorRecord, ValidationOutcome,
};
pub use collaborators::{
    DeploymentResult, Deployer, FlowSynthesizer, SearchAugmenter, StaticValidator,
    ValidationResult,
};
pub use config::{ConfigLoader, FlowsmithConfig};
pub use error::{
    CollaboratorError, ConfigError, InfrastructureError, MemoryError, SessionError, StorageError,
};
pub use memory::{FlowMemory, MemoryStore, SessionLease};
pub use orchestrator::{
    CancelFlag, FlowSession, NextStep, RepairContext, RetryOrchestrator, SessionOutcome,
    SessionReport,
};
pub use pattern::{FailurePattern, Pattern, PatternDelta, PatternExtractor};

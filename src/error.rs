//! Error types for the flow retry/repair system.
//!
//! Deployment and validation failures are *data* recorded on an
//! [`Attempt`](crate::attempt::Attempt); nothing in this module models them.
//! The types here are the hard failures that halt a session or indicate a
//! bookkeeping bug.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Failed to encode record: {0}")]
    Encode(String),

    #[error("Failed to decode record {key}: {message}")]
    Decode { key: String, message: String },
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Integrity violations in the memory store API.
///
/// Every variant indicates the orchestrator's bookkeeping went wrong, never that a
/// generated flow was bad.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Attempt {attempt_number} already recorded for flow '{flow}'")]
    DuplicateAttemptNumber { flow: String, attempt_number: u32 },

    #[error("Attempt numbers for flow '{flow}' must be gapless: expected {expected}, got {actual}")]
    AttemptNumberGap {
        flow: String,
        expected: u32,
        actual: u32,
    },

    #[error("Attempt {attempt_number} not found for flow '{flow}'")]
    AttemptNotFound { flow: String, attempt_number: u32 },

    #[error("{stage} result already recorded for attempt {attempt_number} of flow '{flow}'")]
    AlreadyFinalized {
        flow: String,
        attempt_number: u32,
        stage: OutcomeStage,
    },

    #[error("{stage} result for attempt {attempt_number} of flow '{flow}' must be a final outcome, not NotAttempted")]
    InvalidOutcome {
        flow: String,
        attempt_number: u32,
        stage: OutcomeStage,
    },

    #[error("Attempt {attempt_number} of flow '{flow}' was not deployed; validation cannot be recorded")]
    DeploymentNotSucceeded { flow: String, attempt_number: u32 },

    #[error("Attempt {attempt_number} of flow '{flow}' must be recorded before any outcome")]
    AttemptNotPending { flow: String, attempt_number: u32 },

    #[error("Attempt {attempt_number} of flow '{flow}' has no final outcome yet")]
    AttemptNotFinalized { flow: String, attempt_number: u32 },

    #[error("A session is already active for flow '{0}'")]
    SessionAlreadyActive(String),

    #[error("Session lease for flow '{0}' was issued by a different store")]
    ForeignLease(String),

    #[error("Flow '{0}' has no memory")]
    UnknownFlow(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Which write-once outcome an integrity error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStage {
    Deployment,
    Validation,
}

impl fmt::Display for OutcomeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStage::Deployment => write!(f, "Deployment"),
            OutcomeStage::Validation => write!(f, "Validation"),
        }
    }
}

/// Transport-level failure reported by an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// The external collaborator an infrastructure error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    Synthesizer,
    Deployer,
    Validator,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collaborator::Synthesizer => write!(f, "synthesizer"),
            Collaborator::Deployer => write!(f, "deployer"),
            Collaborator::Validator => write!(f, "validator"),
        }
    }
}

/// A collaborator failure that a different Flow XML cannot fix.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{collaborator} failed during attempt {attempt_number}: {source}")]
pub struct InfrastructureError {
    pub collaborator: Collaborator,
    pub attempt_number: u32,
    #[source]
    pub source: CollaboratorError,
}

/// Hard failures surfaced by the retry orchestrator.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session halted; it is neither succeeded nor exhausted.
    #[error("Session halted: {0}")]
    Infrastructure(#[from] InfrastructureError),

    #[error("Memory integrity violation: {0}")]
    Integrity(#[from] MemoryError),
}

impl SessionError {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, SessionError::Infrastructure(_))
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Configuration validation failed:\n{0}")]
    Invalid(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

//! Configuration System
//!
//! Layered configuration for the retry loop, collaborator timeouts, persistence and
//! logging. Sources are merged by the [`ConfigLoader`]: built-in defaults, the
//! global config file, workspace config files, then `FLOWSMITH__` environment
//! variables.

use crate::attempt::Severity;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;
pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowsmithConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub validator: ValidatorCommandConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Retry budget and pattern policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts allowed in one session
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Other successful attempts that must exhibit a success pattern for it to
    /// survive a failing attempt that also exhibits it
    #[serde(default = "default_min_corroborating_successes")]
    pub min_corroborating_successes: usize,

    #[serde(default = "default_max_failure_patterns_in_context")]
    pub max_failure_patterns_in_context: usize,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_corroborating_successes() -> usize {
    1
}

fn default_max_failure_patterns_in_context() -> usize {
    25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_corroborating_successes: default_min_corroborating_successes(),
            max_failure_patterns_in_context: default_max_failure_patterns_in_context(),
        }
    }
}

/// Per-collaborator call timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_synthesis_secs")]
    pub synthesis_secs: u64,

    #[serde(default = "default_deploy_secs")]
    pub deploy_secs: u64,

    #[serde(default = "default_validate_secs")]
    pub validate_secs: u64,

    #[serde(default = "default_search_secs")]
    pub search_secs: u64,
}

fn default_synthesis_secs() -> u64 {
    180
}

fn default_deploy_secs() -> u64 {
    300
}

fn default_validate_secs() -> u64 {
    120
}

fn default_search_secs() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            synthesis_secs: default_synthesis_secs(),
            deploy_secs: default_deploy_secs(),
            validate_secs: default_validate_secs(),
            search_secs: default_search_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn synthesis(&self) -> Duration {
        Duration::from_secs(self.synthesis_secs)
    }

    pub fn deploy(&self) -> Duration {
        Duration::from_secs(self.deploy_secs)
    }

    pub fn validate(&self) -> Duration {
        Duration::from_secs(self.validate_secs)
    }

    pub fn search(&self) -> Duration {
        Duration::from_secs(self.search_secs)
    }
}

/// Attempt persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub persist: bool,

    /// sled database directory
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "flowsmith")
        .map(|dirs| dirs.data_dir().join("memory"))
        .unwrap_or_else(|| PathBuf::from(".flowsmith/memory"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persist: false,
            path: default_storage_path(),
        }
    }
}

/// External static-analysis command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorCommandConfig {
    #[serde(default = "default_validator_program")]
    pub program: String,

    #[serde(default = "default_validator_args")]
    pub args: Vec<String>,

    /// Lowest severity that fails validation
    #[serde(default = "default_fail_on")]
    pub fail_on: Severity,
}

fn default_validator_program() -> String {
    "flow-scanner".to_string()
}

fn default_validator_args() -> Vec<String> {
    vec!["--stdin".to_string(), "--json".to_string()]
}

fn default_fail_on() -> Severity {
    Severity::Warning
}

impl Default for ValidatorCommandConfig {
    fn default() -> Self {
        Self {
            program: default_validator_program(),
            args: default_validator_args(),
            fail_on: default_fail_on(),
        }
    }
}

/// OpenAI-compatible provider backing the synthesizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key; unset for keyless local servers
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> Option<String> {
    Some("OPENAI_API_KEY".to_string())
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("Model name cannot be empty".to_string());
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(format!("Invalid base URL: {}", self.base_url));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("Temperature {} out of range 0.0-2.0", t));
            }
        }
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Retry(String),
    Timeouts(String),
    Storage(String),
    Validator(String),
    Provider(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Retry(msg) => write!(f, "Retry: {}", msg),
            ValidationError::Timeouts(msg) => write!(f, "Timeouts: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Validator(msg) => write!(f, "Validator: {}", msg),
            ValidationError::Provider(msg) => write!(f, "Provider: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl FlowsmithConfig {
    /// Validate the entire configuration, collecting every problem
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.retry.max_attempts == 0 {
            errors.push(ValidationError::Retry(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.min_corroborating_successes == 0 {
            errors.push(ValidationError::Retry(
                "min_corroborating_successes must be at least 1".to_string(),
            ));
        }

        for (name, secs) in [
            ("synthesis_secs", self.timeouts.synthesis_secs),
            ("deploy_secs", self.timeouts.deploy_secs),
            ("validate_secs", self.timeouts.validate_secs),
            ("search_secs", self.timeouts.search_secs),
        ] {
            if secs == 0 {
                errors.push(ValidationError::Timeouts(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.storage.persist && self.storage.path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "path cannot be empty when persist is enabled".to_string(),
            ));
        }

        if self.validator.program.trim().is_empty() {
            errors.push(ValidationError::Validator(
                "program cannot be empty".to_string(),
            ));
        }

        if let Err(e) = self.provider.validate() {
            errors.push(ValidationError::Provider(e));
        }

        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

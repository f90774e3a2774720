//! Configuration loading facade.

use crate::config::merge::builder_with_defaults;
use crate::config::sources::{environment, global_file, workspace_file};
use crate::config::FlowsmithConfig;
use crate::error::ConfigError;
use config::File;
use std::path::Path;
use tracing::debug;

/// Loads and validates [`FlowsmithConfig`] from layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, global file, workspace files under `workspace_root/config`, then
    /// `FLOWSMITH__` environment variables.
    pub fn load(workspace_root: &Path) -> Result<FlowsmithConfig, ConfigError> {
        let builder = builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root);
        let builder = environment::add_to_builder(builder);

        let config: FlowsmithConfig = builder.build()?.try_deserialize()?;
        Self::checked(config)
    }

    /// Defaults overlaid with a single file. Environment and global sources are
    /// not consulted.
    pub fn load_from_file(path: &Path) -> Result<FlowsmithConfig, ConfigError> {
        let config: FlowsmithConfig = builder_with_defaults()?
            .add_source(File::from(path).required(true))
            .build()?
            .try_deserialize()?;
        Self::checked(config)
    }

    fn checked(config: FlowsmithConfig) -> Result<FlowsmithConfig, ConfigError> {
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ConfigError::Invalid(messages.join("\n"))
        })?;
        debug!(
            max_attempts = config.retry.max_attempts,
            persist = config.storage.persist,
            "Configuration loaded"
        );
        Ok(config)
    }
}

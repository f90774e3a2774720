//! Workspace config files: config/config.toml, then config/{FLOWSMITH_ENV}.toml

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::File;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_NAME_VAR: &str = "FLOWSMITH_ENV";
const DEFAULT_ENV_NAME: &str = "development";

/// Candidate workspace files in merge order, whether or not they exist.
pub fn workspace_config_paths(workspace_root: &Path) -> [PathBuf; 2] {
    let config_dir = workspace_root.join("config");
    let env_name = std::env::var(ENV_NAME_VAR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENV_NAME.to_string());
    [
        config_dir.join("config.toml"),
        config_dir.join(format!("{}.toml", env_name)),
    ]
}

/// Layer the existing workspace files onto `builder`; the env-specific file wins.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> ConfigBuilder<DefaultState> {
    workspace_config_paths(workspace_root)
        .into_iter()
        .filter(|path| path.exists())
        .fold(builder, |builder, path| {
            debug!(config_path = %path.display(), "Workspace configuration file");
            builder.add_source(File::from(path).required(false))
        })
}

//! Environment source: FLOWSMITH__SECTION__KEY=value

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::Environment;

pub const ENV_PREFIX: &str = "FLOWSMITH";
pub const ENV_SEPARATOR: &str = "__";

/// `FLOWSMITH__RETRY__MAX_ATTEMPTS=5` overrides `retry.max_attempts`.
pub fn add_to_builder(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    )
}

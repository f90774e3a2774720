//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Later sources override earlier ones key by key; tables merge, arrays replace.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("retry.max_attempts", 3_i64)?
        .set_default("retry.min_corroborating_successes", 1_i64)?
        .set_default("retry.max_failure_patterns_in_context", 25_i64)?
        .set_default("timeouts.synthesis_secs", 180_i64)?
        .set_default("timeouts.deploy_secs", 300_i64)?
        .set_default("timeouts.validate_secs", 120_i64)?
        .set_default("timeouts.search_secs", 30_i64)?
        .set_default("storage.persist", false)
}

//! Logging System
//!
//! Structured logging using the `tracing` crate. Provides configurable log levels,
//! output formats, and destinations, with environment overrides for each.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error, off
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json, text (default: text)
    #[serde(default = "default_format")]
    pub format: String,

    /// Output destination: stdout, stderr, file, both (stderr and file)
    #[serde(default = "default_output")]
    pub output: String,

    /// Log file path (if output includes a file)
    #[serde(default = "default_log_file")]
    pub file: PathBuf,

    /// Enable colored output (text format, terminal outputs only)
    #[serde(default = "default_true")]
    pub color: bool,

    /// Module-specific log levels
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_output() -> String {
    "stderr".to_string()
}

fn default_log_file() -> PathBuf {
    directories::ProjectDirs::from("", "", "flowsmith")
        .map(|dirs| dirs.data_dir().join("flowsmith.log"))
        .unwrap_or_else(|| PathBuf::from(".flowsmith/flowsmith.log"))
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_format(),
            output: default_output(),
            file: default_log_file(),
            color: default_true(),
            modules: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(
            self.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        ) {
            return Err(format!("Invalid log level: {}", self.level));
        }
        if self.format != "json" && self.format != "text" {
            return Err(format!(
                "Invalid log format: {} (must be 'json' or 'text')",
                self.format
            ));
        }
        parse_output_destinations(&self.output).map_err(|e| e.to_string())?;
        Ok(())
    }
}

type BoxedLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Initialize the logging system
///
/// Priority order (highest to lowest):
/// 1. Environment variables (FLOWSMITH_LOG, FLOWSMITH_LOG_FORMAT, FLOWSMITH_LOG_OUTPUT,
///    FLOWSMITH_LOG_MODULES)
/// 2. Configuration
/// 3. Defaults
///
/// Returns an error instead of panicking when a global subscriber is already set.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<(), ConfigError> {
    let filter = build_env_filter(config)?;
    let format = determine_format(config)?;
    let output = determine_output(config)?;
    let use_color = config.map(|c| c.color).unwrap_or(true);
    let json = format == "json";

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if output.stdout {
        layers.push(fmt_layer(json, use_color, std::io::stdout));
    }
    if output.stderr {
        layers.push(fmt_layer(json, use_color, std::io::stderr));
    }
    if output.file {
        let log_file = config
            .map(|c| c.file.clone())
            .unwrap_or_else(default_log_file);
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::Logging(format!("Failed to create log directory: {}", e))
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .map_err(|e| {
                ConfigError::Logging(format!("Failed to open log file {:?}: {}", log_file, e))
            })?;
        layers.push(fmt_layer(json, false, Arc::new(file)));
    }

    Registry::default()
        .with(filter)
        .with(layers)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))
}

fn fmt_layer<W>(json: bool, ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(writer);
    if json {
        layer.json().boxed()
    } else {
        layer.with_ansi(ansi).boxed()
    }
}

/// Build environment filter from config or environment variables
fn build_env_filter(config: Option<&LoggingConfig>) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_env("FLOWSMITH_LOG") {
        return Ok(filter);
    }

    let level = config.map(|c| c.level.as_str()).unwrap_or("info");
    if level == "off" {
        return Ok(EnvFilter::new("off"));
    }

    let mut filter = EnvFilter::new(level);

    if let Some(config) = config {
        for (module, module_level) in &config.modules {
            filter = filter.add_directive(parse_directive(module, module_level)?);
        }
    }

    // FLOWSMITH_LOG_MODULES=flowsmith::orchestrator=debug,sled=warn
    if let Ok(modules_str) = std::env::var("FLOWSMITH_LOG_MODULES") {
        for module_spec in modules_str.split(',') {
            if let Some((module, module_level)) = module_spec.split_once('=') {
                filter = filter.add_directive(parse_directive(module, module_level)?);
            }
        }
    }

    Ok(filter)
}

fn parse_directive(
    module: &str,
    level: &str,
) -> Result<tracing_subscriber::filter::Directive, ConfigError> {
    format!("{}={}", module.trim(), level.trim())
        .parse()
        .map_err(|e| ConfigError::Logging(format!("Invalid log directive: {}", e)))
}

/// Determine output format from config or environment
fn determine_format(config: Option<&LoggingConfig>) -> Result<String, ConfigError> {
    if let Ok(format) = std::env::var("FLOWSMITH_LOG_FORMAT") {
        if format == "json" || format == "text" {
            return Ok(format);
        }
    }

    let format = config.map(|c| c.format.as_str()).unwrap_or("text");
    if format != "json" && format != "text" {
        return Err(ConfigError::Logging(format!(
            "Invalid log format: {} (must be 'json' or 'text')",
            format
        )));
    }

    Ok(format.to_string())
}

/// Output destinations
#[derive(Debug, PartialEq, Eq)]
struct OutputDestinations {
    stdout: bool,
    stderr: bool,
    file: bool,
}

/// Determine output destinations from config or environment
fn determine_output(config: Option<&LoggingConfig>) -> Result<OutputDestinations, ConfigError> {
    if let Ok(output) = std::env::var("FLOWSMITH_LOG_OUTPUT") {
        return parse_output_destinations(&output);
    }

    let output = config.map(|c| c.output.as_str()).unwrap_or("stderr");
    parse_output_destinations(output)
}

fn parse_output_destinations(output: &str) -> Result<OutputDestinations, ConfigError> {
    match output {
        "stdout" => Ok(OutputDestinations {
            stdout: true,
            stderr: false,
            file: false,
        }),
        "stderr" => Ok(OutputDestinations {
            stdout: false,
            stderr: true,
            file: false,
        }),
        "file" => Ok(OutputDestinations {
            stdout: false,
            stderr: false,
            file: true,
        }),
        "both" => Ok(OutputDestinations {
            stdout: false,
            stderr: true,
            file: true,
        }),
        _ => Err(ConfigError::Logging(format!(
            "Invalid log output: {} (must be 'stdout', 'stderr', 'file', or 'both')",
            output
        ))),
    }
}

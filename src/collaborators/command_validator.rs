//! Static validator backed by an external rules CLI.
//!
//! The flow XML is written to the command's stdin and a JSON report is read from
//! stdout. Accepted report shapes: a bare array of violations, or an object with a
//! `violations` (or `results`) array. Field names follow common scanner output
//! (`ruleId`/`ruleName`, `severity`, `message`/`description`, `element`/`name`).

use crate::attempt::{Severity, ValidationErrorRecord};
use crate::collaborators::{StaticValidator, ValidationResult};
use crate::config::ValidatorCommandConfig;
use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const MAX_STDERR_IN_ERROR: usize = 2048;

pub struct CommandValidator {
    program: String,
    args: Vec<String>,
    fail_on: Severity,
    timeout: Duration,
}

impl CommandValidator {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            fail_on: Severity::Warning,
            timeout,
        }
    }

    pub fn from_config(config: &ValidatorCommandConfig, timeout: Duration) -> Self {
        Self::new(config.program.clone(), config.args.clone(), timeout)
            .with_fail_on(config.fail_on)
    }

    pub fn with_fail_on(mut self, fail_on: Severity) -> Self {
        self.fail_on = fail_on;
        self
    }
}

#[async_trait]
impl StaticValidator for CommandValidator {
    async fn validate(&self, xml: &str) -> Result<ValidationResult, CollaboratorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CollaboratorError::Transport(format!("Failed to spawn {}: {}", self.program, e))
            })?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(xml.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), io::Error>(())
        };

        // Feed stdin while draining stdout so a chatty validator cannot deadlock.
        let (fed, output) = timeout(self.timeout, async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| CollaboratorError::Timeout(self.timeout))?;

        let output = output.map_err(|e| {
            CollaboratorError::Transport(format!("Failed to wait for {}: {}", self.program, e))
        })?;
        if let Err(e) = fed {
            // The validator may legitimately exit before reading all input.
            if e.kind() != io::ErrorKind::BrokenPipe {
                return Err(CollaboratorError::Transport(format!(
                    "Failed to write to {}: {}",
                    self.program, e
                )));
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            if output.status.success() {
                return Ok(ValidationResult::clean());
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.chars().take(MAX_STDERR_IN_ERROR).collect();
            return Err(CollaboratorError::Transport(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        // Scanners commonly exit non-zero when they find violations, so a
        // readable report wins over the exit status.
        let violations = parse_report(&stdout)?;
        debug!(
            program = %self.program,
            violations = violations.len(),
            exit = ?output.status.code(),
            "Validator finished"
        );
        Ok(ValidationResult::from_violations(violations, self.fail_on))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Report {
    Bare(Vec<RawViolation>),
    Wrapped {
        #[serde(alias = "results")]
        violations: Vec<RawViolation>,
    },
}

#[derive(Deserialize)]
struct RawViolation {
    #[serde(alias = "ruleId", alias = "ruleName", alias = "rule")]
    rule_id: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default, alias = "description")]
    message: String,
    #[serde(default, alias = "name", alias = "elementName")]
    element: Option<String>,
}

pub(crate) fn parse_report(stdout: &str) -> Result<Vec<ValidationErrorRecord>, CollaboratorError> {
    let report: Report = serde_json::from_str(stdout.trim())
        .map_err(|e| CollaboratorError::Malformed(format!("Unreadable validator report: {}", e)))?;
    let raw = match report {
        Report::Bare(v) => v,
        Report::Wrapped { violations } => violations,
    };
    Ok(raw
        .into_iter()
        .map(|v| {
            ValidationErrorRecord::new(
                v.rule_id,
                v.severity
                    .as_deref()
                    .map(Severity::from_label)
                    .unwrap_or(Severity::Error),
                v.message,
                v.element.filter(|e| !e.is_empty()),
            )
        })
        .collect())
}

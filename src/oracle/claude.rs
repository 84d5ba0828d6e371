//! Claude Code headless oracle.
//!
//! Runs the `claude` CLI in non-interactive mode (`-p`) with JSON output
//! and maps the result and usage counters onto an [`OracleResponse`].

use super::{Oracle, OracleRequest, OracleResponse};
use crate::config::OracleConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Default timeout for one invocation (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Default, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Internal struct for deserializing Claude JSON output.
#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Clone)]
pub struct ClaudeOracle {
    binary: PathBuf,
    timeout: Duration,
}

impl ClaudeOracle {
    /// Locate the configured command on `PATH`.
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let binary = which::which(&config.command)
            .map_err(|_| Error::OracleBinaryNotFound(config.command.clone()))?;
        Ok(Self {
            binary,
            timeout: config.timeout(),
        })
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Parse the CLI's JSON output.
    pub fn parse_json_response(json_str: &str) -> Result<OracleResponse> {
        let raw: RawClaudeResponse = serde_json::from_str(json_str)?;
        let usage = raw.usage.unwrap_or_default();

        let failed = raw.is_error || raw.subtype.as_deref().is_some_and(|s| s.starts_with("error"));
        if failed {
            let message = raw
                .error
                .or(raw.result)
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(Error::Oracle(message));
        }
        if let Some(error) = raw.error {
            return Err(Error::Oracle(error));
        }

        let text = raw
            .result
            .ok_or_else(|| Error::Oracle("response has no result".to_string()))?;
        Ok(OracleResponse {
            text,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })
    }
}

#[async_trait]
impl Oracle for ClaudeOracle {
    async fn invoke(&self, request: &OracleRequest) -> Result<OracleResponse> {
        debug!(purpose = request.purpose.label(), binary = %self.binary.display(), "invoke");
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg("-p")
                .arg(&request.prompt)
                .arg("--append-system-prompt")
                .arg(&request.system)
                .arg("--output-format")
                .arg("json")
                .output(),
        )
        .await
        .map_err(|_| Error::OracleTimeout(self.timeout))?
        .map_err(|e| Error::Oracle(format!("failed to run {}: {}", self.binary.display(), e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // Structured output wins even on a non-zero exit: it carries the error.
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&stdout) {
            if parsed.is_object() {
                return Self::parse_json_response(&stdout);
            }
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Oracle(message));
        }

        Ok(OracleResponse {
            text: stdout.trim().to_string(),
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

//! Configuration management for dune-poll.
//!
//! Handles loading configuration from TOML files and environment variables.
//! Every setting that controls the query lifecycle lives here and is checked
//! by [`Config::validate`] before any request is made.

use crate::dune::client::DEFAULT_BASE_URL;
use crate::dune::{PerformanceTier, QueryRequest};
use crate::error::{DuneError, Result};
use crate::output::OutputFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "DUNE_API_KEY";

/// Environment variable holding the query id.
pub const QUERY_ID_ENV: &str = "DUNE_QUERY_ID";

/// Environment variable overriding the API base URL.
pub const BASE_URL_ENV: &str = "DUNE_API_URL";

/// Main configuration structure for dune-poll.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Connection settings for the query API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the v1 API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (prefer the DUNE_API_KEY environment variable).
    pub api_key: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: default_request_timeout(),
        }
    }
}

/// The saved query to run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryConfig {
    /// Numeric id from the query URL (e.g. `dune.com/queries/2991576`).
    pub query_id: Option<String>,

    #[serde(default)]
    pub performance: PerformanceTier,

    /// Values for the query's declared parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Status polling intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Seconds between checks while executing.
    #[serde(default = "default_executing_interval")]
    pub executing_interval_secs: u64,

    /// Seconds between checks while pending.
    #[serde(default = "default_pending_interval")]
    pub pending_interval_secs: u64,

    /// Overall deadline for a run in seconds; 0 disables it.
    #[serde(default)]
    pub timeout_secs: u64,
}

fn default_executing_interval() -> u64 {
    15
}

fn default_pending_interval() -> u64 {
    120
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            executing_interval_secs: default_executing_interval(),
            pending_interval_secs: default_pending_interval(),
            timeout_secs: 0,
        }
    }
}

/// Resubmission limits after an execution fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Seconds to wait before resubmitting.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Factor applied to the cooldown after each failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    7200
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_max_cooldown() -> u64 {
    8 * 3600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            cooldown_secs: default_cooldown(),
            backoff_multiplier: default_backoff_multiplier(),
            max_cooldown_secs: default_max_cooldown(),
        }
    }
}

/// Where results are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_path")]
    pub path: PathBuf,

    /// File format; inferred from the extension when unset.
    #[serde(default)]
    pub format: Option<OutputFormat>,

    /// Rows shown in the console preview.
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
}

fn default_output_path() -> PathBuf {
    PathBuf::from("results.csv")
}

fn default_preview_rows() -> usize {
    50
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            format: None,
            preview_rows: default_preview_rows(),
        }
    }
}

impl OutputConfig {
    /// Returns the configured format, falling back to the file extension.
    pub fn resolved_format(&self) -> OutputFormat {
        self.format
            .unwrap_or_else(|| OutputFormat::from_path(&self.path))
    }
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dune-poll")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file.
    ///
    /// A missing file yields the defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| DuneError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            DuneError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Applies DUNE_API_KEY, DUNE_QUERY_ID and DUNE_API_URL.
    ///
    /// Environment values override the file; CLI flags are applied later and
    /// override both.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|v| !v.trim().is_empty()) {
            self.api.api_key = Some(key);
        }
        if let Some(id) = lookup(QUERY_ID_ENV).filter(|v| !v.trim().is_empty()) {
            self.query.query_id = Some(id);
        }
        if let Some(url) = lookup(BASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.api.base_url = url;
        }
    }

    /// Checks that everything a run needs is present and consistent.
    pub fn validate(&self) -> Result<()> {
        match self.api.api_key.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(DuneError::config(format!(
                    "api.api_key is required (or set {API_KEY_ENV})"
                )))
            }
            Some(_) => {}
        }

        let query_id = self.query.query_id.as_deref().map(str::trim).unwrap_or("");
        if query_id.is_empty() {
            return Err(DuneError::config(format!(
                "query.query_id is required (or set {QUERY_ID_ENV})"
            )));
        }
        if !query_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(DuneError::config(format!(
                "query.query_id must be numeric, got '{query_id}'"
            )));
        }

        let url = Url::parse(&self.api.base_url)
            .map_err(|e| DuneError::config(format!("Invalid api.base_url: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(DuneError::config(format!(
                "Invalid scheme '{}' in api.base_url. Expected 'http' or 'https'",
                url.scheme()
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(DuneError::config("api.timeout_secs must be greater than 0"));
        }
        if self.poll.executing_interval_secs == 0 || self.poll.pending_interval_secs == 0 {
            return Err(DuneError::config("poll intervals must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(DuneError::config("retry.max_attempts must be at least 1"));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(DuneError::config(format!(
                "retry.backoff_multiplier must be at least 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.retry.max_cooldown_secs < self.retry.cooldown_secs {
            return Err(DuneError::config(
                "retry.max_cooldown_secs must not be less than retry.cooldown_secs",
            ));
        }

        Ok(())
    }

    /// Builds the query request from the `[query]` section.
    pub fn query_request(&self) -> Result<QueryRequest> {
        let query_id = self
            .query
            .query_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DuneError::config("query.query_id is required"))?;

        let mut request = QueryRequest::new(query_id, self.query.performance);
        request.parameters = self.query.parameters.clone();
        Ok(request)
    }
}

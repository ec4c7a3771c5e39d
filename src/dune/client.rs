//! HTTP client for the Dune API.
//!
//! Implements the QueryService trait against the v1 REST endpoints.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::dune::types::{
    CancelResponse, ErrorResponse, ExecuteResponse, ExecutionId, ExecutionResults,
    ExecutionStatus, QueryRequest, ResultsResponse, StatusResponse,
};
use crate::dune::QueryService;
use crate::error::{DuneError, Result};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Dune API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.dune.com/api/v1/";

/// Header carrying the API key on every request.
const API_KEY_HEADER: &str = "X-Dune-API-Key";

/// Maximum number of attempts for a single request hitting transient errors.
const MAX_REQUEST_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between request attempts (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Dune client configuration.
#[derive(Debug, Clone)]
pub struct DuneClientConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Base URL of the v1 API, ending in a slash.
    pub base_url: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Attempts per request before a transient error is returned.
    pub max_request_attempts: u32,
    /// Delay before the first request retry; doubled after each retry.
    pub retry_base_delay: Duration,
}

impl DuneClientConfig {
    /// Creates a new config with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_request_attempts: MAX_REQUEST_ATTEMPTS,
            retry_base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
        }
    }

    /// Sets the base URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Builds the client config from a validated application config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config
            .api
            .api_key
            .clone()
            .ok_or_else(|| DuneError::config("api.api_key is required (or set DUNE_API_KEY)"))?;

        Ok(Self::new(api_key)
            .with_url(config.api.base_url.clone())
            .with_timeout(config.api.timeout_secs))
    }
}

/// Dune API client.
#[derive(Debug, Clone)]
pub struct DuneClient {
    config: DuneClientConfig,
    base_url: Url,
    client: Client,
}

impl DuneClient {
    /// Creates a new Dune client with the given configuration.
    pub fn new(config: DuneClientConfig) -> Result<Self> {
        let base_url = parse_base_url(&config.base_url)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DuneError::http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            base_url,
            client,
        })
    }

    /// Builds `{base}{module}/{id}/{action}`, escaping each segment.
    pub fn api_url(&self, module: &str, id: &str, action: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DuneError::config(format!("Base URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend([module, id, action]);
        Ok(url)
    }

    /// Returns the execute endpoint URL for a request, including the tier.
    fn execute_url(&self, request: &QueryRequest) -> Result<Url> {
        let mut url = self.api_url("query", &request.query_id, "execute")?;
        url.query_pairs_mut()
            .append_pair("performance", request.performance.as_str());
        Ok(url)
    }

    /// Parses an API error response into a typed error.
    fn parse_error(status: StatusCode, body: &str) -> DuneError {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return DuneError::api(
                status.as_u16(),
                "Authentication failed. Check your DUNE_API_KEY.",
            );
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return DuneError::api(status.as_u16(), "Rate limited. Please wait and try again.");
        }

        if let Ok(error_response) = serde_json::from_str::<ErrorResponse>(body) {
            return DuneError::api(status.as_u16(), error_response.error);
        }

        DuneError::api(status.as_u16(), body.trim().to_string())
    }

    /// Maps a transport failure to an error.
    fn request_error(e: reqwest::Error) -> DuneError {
        if e.is_timeout() {
            DuneError::http("Request timed out")
        } else if e.is_connect() {
            DuneError::http("Failed to connect to the Dune API. Check your network.")
        } else {
            DuneError::http(format!("Request failed: {}", e))
        }
    }

    /// Sends a request, retrying transient failures with exponential backoff.
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let mut last_error = None;
        let mut delay = self.config.retry_base_delay;
        let attempts = self.config.max_request_attempts.max(1);

        for attempt in 1..=attempts {
            debug!("{} {} (attempt {} of {})", method, url.path(), attempt, attempts);

            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header(API_KEY_HEADER, &self.config.api_key);
            if let Some(body) = body {
                request = request.json(body);
            }

            let error = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    match response.text().await {
                        Ok(text) if status.is_success() => {
                            return serde_json::from_str(&text).map_err(|e| {
                                DuneError::parse(format!(
                                    "Unexpected response from {}: {}",
                                    url.path(),
                                    e
                                ))
                            });
                        }
                        Ok(text) => Self::parse_error(status, &text),
                        // A body cut off mid-read is retried like a failed connect.
                        Err(e) => DuneError::http(format!("Failed to read response: {}", e)),
                    }
                }
                Err(e) => Self::request_error(e),
            };

            if !error.is_transient() || attempt >= attempts {
                return Err(error);
            }

            warn!(
                "{} {} failed (attempt {}), retrying in {:?}: {}",
                method,
                url.path(),
                attempt,
                delay,
                error
            );
            last_error = Some(error);

            tokio::time::sleep(delay).await;
            delay *= 2; // Exponential backoff
        }

        Err(last_error.unwrap_or_else(|| DuneError::internal("No request attempts were made")))
    }
}

/// Parses the base URL, requiring http(s) and a trailing slash.
fn parse_base_url(raw: &str) -> Result<Url> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };

    let url = Url::parse(&normalized)
        .map_err(|e| DuneError::config(format!("Invalid API base URL '{raw}': {e}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(DuneError::config(format!(
            "Invalid scheme '{}'. Expected 'http' or 'https'",
            url.scheme()
        )));
    }

    Ok(url)
}

#[async_trait]
impl QueryService for DuneClient {
    async fn submit(&self, request: &QueryRequest) -> Result<ExecutionId> {
        let url = self.execute_url(request)?;
        let body = if request.parameters.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "query_parameters": request.parameters }))
        };

        let response: ExecuteResponse = self.send(Method::POST, url, body.as_ref()).await?;
        if let Some(state) = &response.state {
            debug!("Execution {} submitted in state {}", response.execution_id, state);
        }

        Ok(ExecutionId::new(response.execution_id))
    }

    async fn status(&self, id: &ExecutionId) -> Result<ExecutionStatus> {
        let url = self.api_url("execution", id.as_str(), "status")?;
        let response: StatusResponse = self.send(Method::GET, url, None).await?;

        Ok(ExecutionStatus {
            execution_id: ExecutionId::new(response.execution_id),
            state: response.state,
        })
    }

    async fn results(&self, id: &ExecutionId) -> Result<ExecutionResults> {
        let url = self.api_url("execution", id.as_str(), "results")?;
        let response: ResultsResponse = self.send(Method::GET, url, None).await?;

        Ok(response.into())
    }

    async fn cancel(&self, id: &ExecutionId) -> Result<bool> {
        let url = self.api_url("execution", id.as_str(), "cancel")?;
        let response: CancelResponse = self.send(Method::POST, url, None).await?;

        Ok(response.success)
    }
}

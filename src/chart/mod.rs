pub mod retry;

use crate::config::ChartConfig;
use retry::RetryPolicy;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum ChartApiError {
    ConnectionError(String),
    Timeout(String),
    Status(u16),
    ResponseError(String),
    RequestError(String),
}

impl fmt::Display for ChartApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChartApiError::ConnectionError(msg) => write!(f, "connection error: {}", msg),
            ChartApiError::Timeout(msg) => write!(f, "request timed out: {}", msg),
            ChartApiError::Status(code) => write!(f, "API responded with status code: {}", code),
            ChartApiError::ResponseError(msg) => write!(f, "invalid API response: {}", msg),
            ChartApiError::RequestError(msg) => write!(f, "request error: {}", msg),
        }
    }
}

impl Error for ChartApiError {}

impl ChartApiError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChartApiError::Timeout(e.to_string())
        } else if e.is_connect() {
            ChartApiError::ConnectionError(e.to_string())
        } else if let Some(status) = e.status() {
            ChartApiError::Status(status.as_u16())
        } else {
            ChartApiError::RequestError(e.to_string())
        }
    }

    /// Only connection-establishment failures, timeouts, and HTTP
    /// error-status responses are worth another attempt.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ChartApiError::ConnectionError(_)
                | ChartApiError::Timeout(_)
                | ChartApiError::Status(_)
        )
    }
}

/// Fixed-shape payload the downstream charting endpoint expects: the
/// generated SQL plus empty chart/axis/filter placeholders.
#[derive(Debug, Clone, Serialize)]
pub struct ChartPayload {
    pub raw_sql: String,
    pub chart_type: Option<String>,
    pub x_axis: Option<String>,
    pub y_axis: Option<String>,
    pub title: Option<String>,
    pub filters: Vec<Value>,
    pub group_by: Vec<String>,
}

impl ChartPayload {
    pub fn from_sql(sql: &str) -> Self {
        Self {
            raw_sql: sql.to_string(),
            chart_type: None,
            x_axis: None,
            y_axis: None,
            title: None,
            filters: Vec::new(),
            group_by: Vec::new(),
        }
    }
}

/// Outcome of the downstream call as it appears in the response body.
/// Failure here is soft: the caller still receives the generated SQL.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApiCallResult {
    Success { api_response: Value },
    Error { error: String },
}

pub struct ChartApiClient {
    client: reqwest::Client,
    api_url: String,
    retry: RetryPolicy,
}

impl ChartApiClient {
    pub fn new(config: &ChartConfig) -> Result<Self, ChartApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ChartApiError::RequestError(e.to_string()))?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            retry: RetryPolicy::new(
                config.max_attempts,
                Duration::from_millis(config.retry_delay_ms),
            ),
        })
    }

    /// Submits the generated SQL to the charting endpoint. Downstream
    /// failure never fails the overall request; it folds into the result.
    pub async fn submit(&self, sql: &str) -> ApiCallResult {
        let payload = ChartPayload::from_sql(sql);
        debug!("Submitting generated SQL to chart API: {}", sql);

        match self
            .retry
            .run(|| self.post_payload(&payload), ChartApiError::retryable)
            .await
        {
            Ok(body) => ApiCallResult::Success { api_response: body },
            Err(e) => {
                warn!("Chart API request failed: {}", e);
                ApiCallResult::Error {
                    error: format!("API request failed after retries: {}", e),
                }
            }
        }
    }

    async fn post_payload(&self, payload: &ChartPayload) -> Result<Value, ChartApiError> {
        let response = self
            .client
            .post(&self.api_url)
            .json(payload)
            .send()
            .await
            .map_err(ChartApiError::from_reqwest)?;

        let response = response
            .error_for_status()
            .map_err(ChartApiError::from_reqwest)?;

        response
            .json::<Value>()
            .await
            .map_err(|e| ChartApiError::ResponseError(e.to_string()))
    }
}

//! JSON-over-HTTP client with retry and backoff for outbound collaborators.
//!
//! Shared by the document classifier and the delivery webhook.

use backoff::{future::retry_notify, ExponentialBackoff};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Result, VerificationError};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum retry attempts for transient errors.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Refuse plain-HTTP endpoints.
    pub https_only: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            https_only: true,
        }
    }
}

pub struct JsonHttpClient {
    client: Client,
    config: HttpClientConfig,
}

impl JsonHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .https_only(config.https_only)
            .build()
            .map_err(|e| VerificationError::provider(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// POST `body` and decode the JSON reply, retrying transient failures.
    pub async fn post_json<B, R>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
        service: &str,
    ) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        retry_notify(
            self.build_backoff(),
            || async move {
                let response = self.send_once(url, bearer, body, service).await?;
                response.json::<R>().await.map_err(|e| {
                    warn!(error = %e, service, "Failed to parse JSON response");
                    backoff::Error::permanent(VerificationError::provider(format!(
                        "Failed to parse {service} response: {e}"
                    )))
                })
            },
            |err: VerificationError, duration: Duration| {
                warn!(
                    error = %err,
                    retry_after_ms = duration.as_millis() as u64,
                    "Retry scheduled"
                );
            },
        )
        .await
    }

    /// Single POST. Errors come back classified as transient or permanent.
    pub async fn send_once<B>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
        service: &str,
    ) -> std::result::Result<reqwest::Response, backoff::Error<VerificationError>>
    where
        B: Serialize + Sync,
    {
        let start = Instant::now();

        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            let latency_ms = start.elapsed().as_millis() as u64;
            if is_transient_error(&e) {
                warn!(error = %e, latency_ms, service, "Transient error, will retry");
                backoff::Error::transient(VerificationError::provider(format!(
                    "{service} unreachable: {e}"
                )))
            } else {
                warn!(error = %e, latency_ms, service, "Permanent error, aborting");
                backoff::Error::permanent(VerificationError::provider(format!(
                    "{service} request failed: {e}"
                )))
            }
        })?;

        let status = response.status();
        debug!(status = %status, service, "Received HTTP response");

        if !status.is_success() {
            let latency_ms = start.elapsed().as_millis() as u64;
            let err = VerificationError::provider(format!("{service} returned status: {status}"));
            return if is_transient_status(status) {
                warn!(status = %status, latency_ms, "Transient HTTP status, will retry");
                Err(backoff::Error::transient(err))
            } else {
                warn!(status = %status, latency_ms, "Permanent HTTP error");
                Err(backoff::Error::permanent(err))
            };
        }

        Ok(response)
    }

    fn build_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_interval,
            max_interval: self.config.max_interval,
            max_elapsed_time: Some(self.config.timeout * self.config.max_retries),
            ..Default::default()
        }
    }
}

pub fn is_transient_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
            | StatusCode::BAD_GATEWAY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_status_codes() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn test_client_builds_with_defaults() {
        assert!(JsonHttpClient::new(HttpClientConfig::default()).is_ok());
    }
}

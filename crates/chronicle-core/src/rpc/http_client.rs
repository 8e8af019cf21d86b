use reqwest::{Client, ClientBuilder};
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;

use super::RpcError;

/// Configuration for HTTP client concurrency and retry behavior.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum number of concurrent HTTP requests to one node.
    pub concurrent_limit: usize,
    /// Permit acquisition timeout in milliseconds.
    pub permit_timeout_ms: u64,
    /// Retries for 5xx responses and connection errors before giving up.
    pub max_retries: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self { concurrent_limit: 64, permit_timeout_ms: 2_000, max_retries: 2 }
    }
}

/// HTTP client with semaphore-based concurrency control.
///
/// One client is shared by every indexer task talking to the same node so that
/// backfill bursts cannot starve the live watcher of connections.
pub struct HttpClient {
    client: Client,
    concurrent_limit: Arc<Semaphore>,
    config: HttpClientConfig,
}

impl HttpClient {
    /// Sanitizes network errors so node URLs with embedded API keys never reach logs.
    fn sanitize_network_error(error: &reqwest::Error) -> String {
        if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_timeout() {
            "connection timed out".to_string()
        } else if error.is_body() {
            "response body error".to_string()
        } else if error.is_decode() {
            "response decode error".to_string()
        } else {
            "network error".to_string()
        }
    }

    /// Creates a new HTTP client with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn with_config(config: HttpClientConfig) -> Result<Self, RpcError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .connect_timeout(Duration::from_secs(5))
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("chronicle/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                RpcError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self { client, concurrent_limit: Arc::new(Semaphore::new(config.concurrent_limit)), config })
    }

    /// Sends a JSON POST body and returns the raw response bytes.
    ///
    /// Server errors and connection failures are retried with exponential backoff
    /// up to `max_retries` times; 4xx responses are returned immediately.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`] if permit acquisition or the request times out
    /// - [`RpcError::ConcurrencyLimit`] if the semaphore is closed
    /// - [`RpcError::HttpError`] for non-success HTTP status codes
    /// - [`RpcError::ConnectionFailed`] for network failures
    pub async fn send_request(
        &self,
        url: &str,
        body: bytes::Bytes,
        timeout: Duration,
    ) -> Result<bytes::Bytes, RpcError> {
        let _permit = tokio::time::timeout(
            Duration::from_millis(self.config.permit_timeout_ms),
            Arc::clone(&self.concurrent_limit).acquire_owned(),
        )
        .await
        .map_err(|_| {
            tracing::warn!(
                available_permits = self.concurrent_limit.available_permits(),
                "http client semaphore acquisition timeout"
            );
            RpcError::Timeout
        })?
        .map_err(|_| RpcError::ConcurrencyLimit("http client semaphore closed".to_string()))?;

        let mut retries = 0;

        loop {
            let result = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .body(body.clone())
                .timeout(timeout)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    return response.bytes().await.map_err(RpcError::Network);
                }
                Ok(response) if response.status().is_server_error() && retries < self.config.max_retries => {
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(100 * (1 << retries))).await;
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let raw_text = response.text().await.unwrap_or_default();
                    let text = if raw_text.chars().count() > 256 {
                        format!("{}... (truncated)", raw_text.chars().take(256).collect::<String>())
                    } else {
                        raw_text
                    };
                    tracing::trace!(status, "http request failed");
                    return Err(RpcError::HttpError(status, text));
                }
                Err(e) if e.is_timeout() => return Err(RpcError::Timeout),
                Err(_) if retries < self.config.max_retries => {
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(100 * (1 << retries))).await;
                }
                Err(e) => return Err(RpcError::ConnectionFailed(Self::sanitize_network_error(&e))),
            }
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.concurrent_limit.available_permits()
    }
}

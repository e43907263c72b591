//! Shared HTTP client with exponential backoff.
//!
//! One connection pool serves every transfer of a process. Transport errors
//! and the transient statuses in [`RETRY_STATUSES`] are retried; any other
//! response is handed back to the caller.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use artsync_config::HttpConfig;
use artsync_core::{Error, Result};
use futures_util::StreamExt;
use reqwest::{Body, RequestBuilder, Response, StatusCode};
use tokio_util::io::ReaderStream;

pub const RETRY_STATUSES: [u16; 8] = [308, 408, 409, 429, 500, 502, 503, 504];

/// Receives the number of bytes sent since the previous call.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 16,
            backoff_factor: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// `factor * 2^attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_factor
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
    }
}

#[derive(Clone)]
pub struct RetryingClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

fn is_retryable(status: StatusCode) -> bool {
    RETRY_STATUSES.contains(&status.as_u16())
}

impl RetryingClient {
    pub fn new(client: reqwest::Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn from_config(config: &HttpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("artsync/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(config.pool_max_idle_per_host);
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| Error::Other(anyhow::anyhow!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::new(
            client,
            RetryPolicy {
                max_retries: config.max_retries,
                backoff_factor: Duration::from_secs_f64(config.backoff_factor_secs.max(0.0)),
            },
        ))
    }

    /// The underlying pooled client, shared with reference handlers.
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends the request produced by `build`, rebuilding it for every attempt.
    pub async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> Result<RequestBuilder>,
    {
        let mut attempt = 0;
        loop {
            let outcome = build(&self.client)?.send().await;
            let retry_reason = match &outcome {
                Ok(response) if is_retryable(response.status()) => {
                    format!("status {}", response.status())
                }
                Ok(_) => break outcome.map_err(|e| Error::Http(e.to_string())),
                Err(e) => e.to_string(),
            };
            if attempt >= self.retry.max_retries {
                break outcome.map_err(|e| Error::Http(e.to_string()));
            }

            let delay = self.retry.delay(attempt);
            tracing::warn!(
                attempt = attempt + 1,
                max_retries = self.retry.max_retries,
                "HTTP request failed ({}), retrying in {:?}",
                retry_reason,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// PUTs a file to a (signed) upload URL. `headers` are `Name:Value` pairs.
    pub async fn upload_file(
        &self,
        url: &str,
        headers: &[String],
        path: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<()> {
        let pairs: Vec<(String, String)> = headers
            .iter()
            .filter_map(|h| h.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();

        let response = self
            .send(|client| {
                let file = std::fs::File::open(path)?;
                let len = file.metadata()?.len();
                let progress = progress.clone();
                let stream = ReaderStream::new(tokio::fs::File::from_std(file)).map(move |chunk| {
                    if let (Ok(bytes), Some(progress)) = (&chunk, &progress) {
                        progress(bytes.len() as u64);
                    }
                    chunk
                });
                let mut request = client
                    .put(url)
                    .header(reqwest::header::CONTENT_LENGTH, len)
                    .body(Body::wrap_stream(stream));
                for (name, value) in &pairs {
                    request = request.header(name.as_str(), value.as_str());
                }
                Ok(request)
            })
            .await?;

        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

use crate::error::FinRagError;
use bytes::Bytes;
use log::{debug, warn};
use rand::Rng;
use reqwest::{header, Client, StatusCode};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::time::sleep;

/// Defines the retry strategy for API calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub jitter: Jitter,
    /// Per-attempt request timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            jitter: Jitter::Full,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let mut delay_ms = self.base_delay_ms * 2_u64.pow(attempt);
        if let Jitter::Full = self.jitter {
            delay_ms += rand::thread_rng().gen_range(0..=delay_ms / 4);
        }
        Duration::from_millis(delay_ms)
    }
}

/// Defines the type of jitter to apply to retry delays.
#[derive(Debug, Clone, Copy)]
pub enum Jitter {
    Full,
    None,
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

/// Executes a single JSON POST with retry logic and returns the raw body.
pub async fn execute_single_call(
        url: &str,
        headers: header::HeaderMap,
        body: &JsonValue,
        retry_policy: &RetryPolicy,
    ) -> Result<String, FinRagError> {
    let client = Client::builder().timeout(retry_policy.timeout).build()?;
    let attempts = retry_policy.max_retries.max(1);

    for i in 0..attempts {
        let response_result = client
            .post(url)
            .headers(headers.clone())
            .json(body)
            .send()
            .await;

        match response_result {
            Ok(response) => {
                let status = response.status();
                let response_text = response.text().await?;

                if status.is_success() {
                    return Ok(response_text);
                }

                if is_retryable(status) && i < attempts - 1 {
                    warn!("Provider returned {}. Retrying... (Attempt {}/{})", status, i + 1, attempts);
                    sleep(retry_policy.backoff(i)).await;
                    continue;
                }
                return Err(FinRagError::Api {
                    status: status.as_u16(),
                    body: response_text,
                });
            }
            Err(e) => {
                warn!("Network request failed (Attempt {}/{}): {}", i + 1, attempts, e);
                if i >= attempts - 1 {
                    return Err(e.into());
                }
                sleep(retry_policy.backoff(i)).await;
            }
        }
    }
    Err(FinRagError::Chat(
        "API call exhausted all retries without success.".to_string(),
    ))
}

/// Fetches a document over HTTP GET with the same retry behaviour.
pub async fn fetch_bytes(url: &str, retry_policy: &RetryPolicy) -> Result<Bytes, FinRagError> {
    let client = Client::builder().timeout(retry_policy.timeout).build()?;
    let attempts = retry_policy.max_retries.max(1);

    for i in 0..attempts {
        debug!("GET {} (attempt {}/{})", url, i + 1, attempts);
        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.bytes().await?;
                if status.is_success() {
                    return Ok(body);
                }
                if is_retryable(status) && i < attempts - 1 {
                    sleep(retry_policy.backoff(i)).await;
                    continue;
                }
                return Err(FinRagError::Api {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }
            Err(e) => {
                if i >= attempts - 1 {
                    return Err(e.into());
                }
                warn!("GET {} failed (Attempt {}/{}): {}", url, i + 1, attempts, e);
                sleep(retry_policy.backoff(i)).await;
            }
        }
    }
    Err(FinRagError::Corpus(format!("GET {} exhausted all retries", url)))
}

/// [`fetch_bytes`] for text documents.
pub async fn fetch_text(url: &str, retry_policy: &RetryPolicy) -> Result<String, FinRagError> {
    let body = fetch_bytes(url, retry_policy).await?;
    String::from_utf8(body.to_vec())
        .map_err(|e| FinRagError::Corpus(format!("{} is not UTF-8 text: {}", url, e)))
}

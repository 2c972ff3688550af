//! Resilient HTTP fetch, alerting, and guarded catalog publishing.

mod alert;
mod catalog;
mod publish;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use encoding_rs::{Encoding, UTF_8};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info_span, warn, Instrument};

pub use alert::{
    build_alerter, Alert, AlertConfig, AlertSeverity, Alerter, FanoutAlerter, LogOnlyAlerter,
    MemoryAlerter, SmtpAlerter, SmtpSettings, WebhookAlerter,
};
pub use catalog::{
    count_catalog_rows, encode_catalog_csv, parse_catalog_csv, read_catalog_rows, validate_catalog_file,
    validate_rows, CatalogValidation,
};
pub use publish::{GateConfig, PublishGate};

pub const CRATE_NAME: &str = "offerfeed-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fixed-delay retry budget for one retrieval.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        decode_body(&self.body, self.content_type.as_deref())
    }
}

/// Decodes with the `charset` of a Content-Type value, falling back to UTF-8.
pub fn decode_body(body: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(|value| {
            value.split(';').skip(1).find_map(|param| {
                let (name, label) = param.split_once('=')?;
                name.trim()
                    .eq_ignore_ascii_case("charset")
                    .then(|| label.trim().trim_matches('"'))
            })
        })
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("invalid json from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetch pool closed")]
    PoolClosed,
}

pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
    alerter: Arc<dyn Alerter>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, alerter: Arc<dyn Alerter>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            retry: config.retry,
            alerter,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Retrieves `url`, retrying with a fixed delay. Terminal failures are alerted before returning.
    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::PoolClosed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::PoolClosed)?;

        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retry(source_id, url).instrument(span).await
    }

    async fn fetch_with_retry(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let attempts = self.retry.attempts();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let (disposition, failure) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    match resp.bytes().await {
                        Ok(body) => {
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                content_type,
                                body: body.to_vec(),
                            })
                        }
                        Err(err) => (
                            RetryDisposition::Retryable,
                            FetchError::Request {
                                url: url.to_string(),
                                attempts: attempt,
                                source: err,
                            },
                        ),
                    }
                }
                Ok(resp) => {
                    let status = resp.status();
                    (
                        classify_status(status),
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                            attempts: attempt,
                        },
                    )
                }
                Err(err) => (
                    classify_reqwest_error(&err),
                    FetchError::Request {
                        url: url.to_string(),
                        attempts: attempt,
                        source: err,
                    },
                ),
            };

            if disposition == RetryDisposition::Retryable && attempt < attempts {
                warn!(attempt, attempts, error = %failure, "fetch failed; retrying in {:?}", self.retry.delay);
                tokio::time::sleep(self.retry.delay).await;
                continue;
            }

            return Err(self.give_up(source_id, failure).await);
        }
    }

    async fn give_up(&self, source_id: &str, failure: FetchError) -> FetchError {
        error!(source_id, error = %failure, "fetch exhausted");
        self.alerter
            .send(&Alert::error(
                "Network Error",
                format!("Source {source_id}: {failure}"),
            ))
            .await;
        failure
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<String, FetchError> {
        let resp = self.fetch_bytes(source_id, url).await?;
        Ok(resp.text())
    }

    pub async fn fetch_json(&self, source_id: &str, url: &str) -> Result<serde_json::Value, FetchError> {
        let resp = self.fetch_bytes(source_id, url).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Json {
            url: resp.final_url,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn body_text_follows_the_declared_charset() {
        let latin2 = b"Bia\xb3y Jade, rata 1 999 z\xb3";
        assert_eq!(
            decode_body(latin2, Some("text/html; charset=ISO-8859-2")),
            "Biały Jade, rata 1 999 zł"
        );
        assert_eq!(
            decode_body("Biały".as_bytes(), Some("text/html; charset=\"utf-8\"")),
            "Biały"
        );
        assert_eq!(decode_body("zł".as_bytes(), None), "zł");
        assert_eq!(decode_body("zł".as_bytes(), Some("text/html; charset=bogus")), "zł");
    }

    #[test]
    fn retry_policy_always_allows_one_attempt() {
        let policy = RetryPolicy {
            max_attempts: 0,
            delay: Duration::from_millis(1),
        };
        assert_eq!(policy.attempts(), 1);
    }

    #[tokio::test]
    async fn exhausted_fetch_raises_typed_error_and_alerts() {
        let alerter = Arc::new(MemoryAlerter::default());
        let fetcher = HttpFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_secs(2),
                retry: RetryPolicy {
                    max_attempts: 2,
                    delay: Duration::from_millis(5),
                },
                ..Default::default()
            },
            alerter.clone(),
        )
        .expect("fetcher");

        // Port 9 (discard) is closed on loopback, so every attempt is a connect error.
        let err = fetcher
            .fetch_bytes("test", "http://127.0.0.1:9/offers")
            .await
            .expect_err("connection must fail");

        match err {
            FetchError::Request { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other}"),
        }
        let alerts = alerter.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Error);
        assert_eq!(alerts[0].topic, "Network Error");
    }
}

//! HTTP client for the archive API.
//!
//! [`ApiClient`] wraps a `reqwest` client with the bearer token from
//! [`TokenManager`], a hard per-attempt deadline, status classification and
//! the shared retry loop from [`retry`].

pub mod retry;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;

pub use retry::RetryConfig;
use retry::with_retry;

use crate::config::{ApiConfig, Config};
use crate::telemetry;
use crate::token::{AuthToken, TokenManager};
use crate::{GalcacheError, Result};

/// Longest error body excerpt carried into an error message.
const ERROR_BODY_EXCERPT: usize = 200;

/// Build the shared HTTP client: user agent, JSON accept header and the
/// `version: 1` header the archive API expects.
///
/// Only connecting is bounded here; callers enforce the per-attempt
/// deadline themselves so it surfaces as [`GalcacheError::Timeout`].
pub fn http_client(api: &ApiConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json;charset=utf-8"),
    );
    headers.insert("version", HeaderValue::from_static("1"));
    Client::builder()
        .user_agent(api.user_agent.as_str())
        .default_headers(headers)
        .connect_timeout(api.request_timeout())
        .build()
        .map_err(|e| GalcacheError::Config(format!("failed to build HTTP client: {e}")))
}

/// Authenticated, retrying client for the archive API.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    retry: RetryConfig,
    attempt_timeout: Duration,
}

impl ApiClient {
    pub fn new(config: &Config, tokens: Arc<TokenManager>) -> Result<Self> {
        Ok(Self::with_http(
            http_client(&config.api)?,
            config,
            tokens,
        ))
    }

    /// Reuse an existing HTTP client (the token source shares it).
    pub fn with_http(http: Client, config: &Config, tokens: Arc<TokenManager>) -> Self {
        Self {
            http,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            tokens,
            retry: RetryConfig::from_config(config),
            attempt_timeout: config.api.request_timeout(),
        }
    }

    /// Override the retry policy (tests shorten the backoff).
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET {base_url}{path}?{params}` and parse the body as JSON.
    pub async fn fetch(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let refreshed = AtomicBool::new(false);
        with_retry(&self.retry, path, || {
            self.authorized_attempt(&url, params, true, &refreshed, read_json)
        })
        .await
    }

    /// Download raw bytes, failing with [`GalcacheError::TooLarge`] as soon
    /// as the payload is known to exceed `limit`.
    ///
    /// The bearer token is only sent to URLs under the API base URL.
    pub async fn fetch_bytes(&self, url: &str, limit: u64) -> Result<Vec<u8>> {
        let authorized = url
            .strip_prefix(self.base_url.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?']));
        let refreshed = AtomicBool::new(false);
        with_retry(&self.retry, "image", || {
            self.authorized_attempt(url, &[], authorized, &refreshed, move |response| {
                read_capped(response, limit)
            })
        })
        .await
    }

    /// One attempt, plus a retry with a fresh token if it was rejected as
    /// unauthenticated. `refreshed` spans every attempt of one request, so a
    /// request refreshes at most once.
    async fn authorized_attempt<T, F, Fut>(
        &self,
        url: &str,
        params: &[(&str, String)],
        authorized: bool,
        refreshed: &AtomicBool,
        read: F,
    ) -> Result<T>
    where
        F: Fn(Response) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = if authorized {
            Some(self.tokens.current_token().await?)
        } else {
            None
        };
        let result = self.attempt(url, params, token.as_deref(), &read).await;

        let rejected = match (&result, &token) {
            (Err(GalcacheError::Auth(_)), Some(rejected)) => Arc::clone(rejected),
            _ => return result,
        };
        if refreshed.swap(true, Ordering::SeqCst) {
            return result;
        }
        debug!(url, "token rejected, refreshing");
        let fresh = self.tokens.refresh_after_rejection(&rejected).await?;
        self.attempt(url, params, Some(&fresh), &read).await
    }

    async fn attempt<T, F, Fut>(
        &self,
        url: &str,
        params: &[(&str, String)],
        token: Option<&AuthToken>,
        read: &F,
    ) -> Result<T>
    where
        F: Fn(Response) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let call = async {
            let mut request = self.http.get(url);
            if !params.is_empty() {
                request = request.query(params);
            }
            if let Some(token) = token {
                request = request.header(AUTHORIZATION, token.bearer());
            }
            let response = request.send().await?;
            let response = check_status(response).await?;
            read(response).await
        };

        let outcome = match tokio::time::timeout(self.attempt_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GalcacheError::Timeout(self.attempt_timeout)),
        };
        let status = if outcome.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::UPSTREAM_REQUESTS_TOTAL, "status" => status).increment(1);
        outcome
    }
}

/// Map a non-success response to the error taxonomy.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > ERROR_BODY_EXCERPT {
        let cut = (0..=ERROR_BODY_EXCERPT)
            .rev()
            .find(|&i| message.is_char_boundary(i))
            .unwrap_or(0);
        message.truncate(cut);
    }
    if message.is_empty() {
        message = status.to_string();
    }

    Err(match code {
        401 | 403 => GalcacheError::Auth(format!("HTTP {code}: {message}")),
        404 => GalcacheError::NotFound(message),
        429 => GalcacheError::UpstreamRateLimited { retry_after },
        500..=599 => GalcacheError::Server {
            status: code,
            message,
        },
        _ => GalcacheError::Api {
            status: code,
            message,
        },
    })
}

async fn read_json(response: Response) -> Result<Value> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(GalcacheError::from)
}

async fn read_capped(mut response: Response, limit: u64) -> Result<Vec<u8>> {
    if let Some(size) = response.content_length().filter(|&size| size > limit) {
        return Err(GalcacheError::TooLarge { size, limit });
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        body.extend_from_slice(&chunk);
        let size = body.len() as u64;
        if size > limit {
            return Err(GalcacheError::TooLarge { size, limit });
        }
    }
    Ok(body)
}

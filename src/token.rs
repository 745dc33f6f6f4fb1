//! Bearer token lifecycle.
//!
//! [`TokenManager`] owns the single live [`AuthToken`]. Tokens come from a
//! [`TokenSource`]; in production that is [`OAuthTokenSource`], which
//! performs the client-credentials grant against the archive API.
//!
//! Two refresh paths exist:
//!
//! - **Proactive**: [`TokenManager::spawn_refresh_task()`] swaps in a fresh
//!   token every refresh period. A failed refresh keeps the old token until
//!   it actually expires; after that callers get [`GalcacheError::Auth`]
//!   until some refresh succeeds.
//! - **Reactive**: when the upstream rejects a token,
//!   [`TokenManager::refresh_after_rejection()`] refreshes once. Concurrent
//!   rejections of the same token share that one refresh.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::background::{BackgroundTask, deadline_after};
use crate::telemetry;
use crate::{GalcacheError, Result};

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// A bearer credential and its validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl AuthToken {
    /// A token issued now, valid for `lifetime`.
    pub fn new(value: impl Into<String>, lifetime: Duration) -> Self {
        let issued_at = Instant::now();
        Self {
            value: value.into(),
            issued_at,
            expires_at: deadline_after(issued_at, lifetime),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

/// Where new tokens come from.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Obtain a fresh token.
    async fn issue(&self) -> Result<AuthToken>;
}

/// Client-credentials grant against `{base_url}/oauth/token`.
pub struct OAuthTokenSource {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    timeout: Duration,
}

impl OAuthTokenSource {
    pub fn new(
        http: Client,
        base_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: format!("{}/oauth/token", base_url.trim_end_matches('/')),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Deadline for one token request. Default: 30s.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn issue(&self) -> Result<AuthToken> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", "public"),
        ];
        let request = async {
            let response = self
                .http
                .post(&self.token_url)
                .form(&form)
                .send()
                .await
                .map_err(|e| GalcacheError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(GalcacheError::Auth(format!(
                    "token endpoint returned HTTP {status}"
                )));
            }

            response
                .json::<TokenResponse>()
                .await
                .map_err(|e| GalcacheError::Malformed(format!("token response: {e}")))
        };
        let body = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| GalcacheError::Timeout(self.timeout))??;
        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        Ok(AuthToken::new(body.access_token, lifetime))
    }
}

/// Observable lifecycle phase of the managed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    /// No token has ever been issued.
    Unissued,
    Valid,
    /// Live, but due to expire before the next scheduled refresh.
    Expiring,
    /// A refresh is in progress.
    Refreshing,
    /// The last refresh failed and the old token has expired.
    Failed,
}

#[derive(Default)]
struct TokenState {
    token: Option<Arc<AuthToken>>,
    /// Set when the most recent refresh failed; cleared on success.
    last_error: Option<String>,
}

/// Owns the live token and both refresh paths.
pub struct TokenManager {
    source: Arc<dyn TokenSource>,
    state: RwLock<TokenState>,
    /// Held for the duration of a refresh. Serializes refreshes.
    refresh_lock: Mutex<()>,
    refresh_period: Duration,
}

impl TokenManager {
    /// `refresh_period` is the proactive refresh interval; a token that will
    /// expire within one period reports [`TokenPhase::Expiring`].
    pub fn new(source: Arc<dyn TokenSource>, refresh_period: Duration) -> Self {
        Self {
            source,
            state: RwLock::new(TokenState::default()),
            refresh_lock: Mutex::new(()),
            refresh_period,
        }
    }

    /// Return the live token.
    ///
    /// Blocks only when there is no usable token and no failure on record
    /// (the first call, or a token that lapsed between refreshes). If the
    /// last refresh failed and the old token has expired, fails with
    /// [`GalcacheError::Auth`] without contacting the token endpoint.
    pub async fn current_token(&self) -> Result<Arc<AuthToken>> {
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            match (&state.token, &state.last_error) {
                (Some(token), _) if !token.is_expired() => return Ok(Arc::clone(token)),
                (_, Some(reason)) if state.token.is_some() => {
                    return Err(GalcacheError::Auth(format!(
                        "token expired and refresh failed: {reason}"
                    )));
                }
                _ => {}
            }
        }
        let stale = self.snapshot();
        self.refresh_from(stale).await
    }

    /// Reactive path: the upstream rejected `rejected`. Refresh unless
    /// another caller already replaced it, and return the token to retry
    /// with.
    pub async fn refresh_after_rejection(&self, rejected: &Arc<AuthToken>) -> Result<Arc<AuthToken>> {
        self.refresh_from(Some(Arc::clone(rejected))).await
    }

    /// Proactive refresh, regardless of how fresh the current token is.
    pub async fn refresh_now(&self) -> Result<Arc<AuthToken>> {
        self.refresh_from(self.snapshot()).await
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> TokenPhase {
        if self.refresh_lock.try_lock().is_err() {
            return TokenPhase::Refreshing;
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &state.token {
            None if state.last_error.is_some() => TokenPhase::Failed,
            None => TokenPhase::Unissued,
            Some(token) if token.is_expired() => {
                if state.last_error.is_some() {
                    TokenPhase::Failed
                } else {
                    TokenPhase::Expiring
                }
            }
            Some(token) if token.expires_at <= deadline_after(Instant::now(), self.refresh_period) => {
                TokenPhase::Expiring
            }
            Some(_) => TokenPhase::Valid,
        }
    }

    /// Start the proactive refresh timer.
    pub fn spawn_refresh_task(self: &Arc<Self>) -> BackgroundTask {
        let manager = Arc::clone(self);
        BackgroundTask::spawn_periodic("token-refresh", self.refresh_period, move || {
            let manager = Arc::clone(&manager);
            async move {
                if let Err(e) = manager.refresh_now().await {
                    warn!(error = %e, "scheduled token refresh failed");
                }
            }
        })
    }

    fn snapshot(&self) -> Option<Arc<AuthToken>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .token
            .clone()
    }

    /// Refresh unless the live token is already newer than `stale`.
    async fn refresh_from(&self, stale: Option<Arc<AuthToken>>) -> Result<Arc<AuthToken>> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(current) = self.snapshot() {
            let replaced = match &stale {
                Some(stale) => !Arc::ptr_eq(stale, &current),
                None => true,
            };
            if replaced && !current.is_expired() {
                debug!("token already refreshed by another caller");
                return Ok(current);
            }
        }

        match self.source.issue().await {
            Ok(token) => {
                let token = Arc::new(token);
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                state.token = Some(Arc::clone(&token));
                state.last_error = None;
                metrics::counter!(telemetry::TOKEN_REFRESHES_TOTAL, "status" => "ok").increment(1);
                info!(
                    expires_in_secs = token.expires_at.saturating_duration_since(token.issued_at).as_secs(),
                    "issued new access token"
                );
                Ok(token)
            }
            Err(e) => {
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                state.last_error = Some(e.to_string());
                metrics::counter!(telemetry::TOKEN_REFRESHES_TOTAL, "status" => "error")
                    .increment(1);
                let keeps_old = state.token.as_ref().is_some_and(|t| !t.is_expired());
                warn!(error = %e, keeps_old, "token refresh failed");
                Err(match e {
                    GalcacheError::Auth(_) => e,
                    other => GalcacheError::Auth(format!("token refresh failed: {other}")),
                })
            }
        }
    }
}

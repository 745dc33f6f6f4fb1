//! Builder for configuring gateway instances

use std::sync::Arc;

use super::Gateway;
use crate::api::{self, ApiClient, RetryConfig};
use crate::cache::{ImageCache, ImageCacheConfig, ResponseCache, ResponseCacheConfig};
use crate::config::Config;
use crate::fuzzy::FuzzyMatcher;
use crate::rate_limit::RateLimiter;
use crate::token::{OAuthTokenSource, TokenManager, TokenSource};
use crate::{GalcacheError, Result};

/// Builder for [`Gateway`].
///
/// Every component is derived from the shared [`Config`]. Tests swap in
/// their own token source or a faster retry policy.
pub struct GatewayBuilder {
    config: Arc<Config>,
    token_source: Option<Arc<dyn TokenSource>>,
    retry: Option<RetryConfig>,
}

impl GatewayBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            token_source: None,
            retry: None,
        }
    }

    /// Use `source` instead of the OAuth client-credentials grant.
    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Override the retry policy derived from `max_retries`.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Build the gateway, opening (and indexing) the image cache directory.
    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;
        config.validate()?;

        let http = api::http_client(&config.api)?;

        let source = match self.token_source {
            Some(source) => source,
            None => {
                let client_id = config
                    .api
                    .client_id
                    .clone()
                    .ok_or_else(|| GalcacheError::Config("missing api.client_id".into()))?;
                let client_secret = config
                    .api
                    .client_secret
                    .clone()
                    .ok_or_else(|| GalcacheError::Config("missing api.client_secret".into()))?;
                Arc::new(
                    OAuthTokenSource::new(
                        http.clone(),
                        &config.api.base_url,
                        client_id,
                        client_secret,
                    )
                    .timeout(config.api.request_timeout()),
                )
            }
        };
        let tokens = Arc::new(TokenManager::new(source, config.token_refresh_period()));

        let mut api = ApiClient::with_http(http, &config, Arc::clone(&tokens));
        if let Some(retry) = self.retry {
            api = api.with_retry_config(retry);
        }

        let responses = ResponseCache::new(ResponseCacheConfig::from_config(&config));
        let images = ImageCache::open(ImageCacheConfig::from_config(&config)).await?;

        Ok(Gateway {
            matcher: FuzzyMatcher::from_config(&config),
            limiter: RateLimiter::from_config(&config),
            config,
            tokens,
            api,
            responses,
            images,
        })
    }
}

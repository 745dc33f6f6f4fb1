//! The command facade.
//!
//! [`Gateway`] exposes the user-facing commands. Each one passes the
//! caller through the [`RateLimiter`], then reads through the
//! [`ResponseCache`] (and the [`FuzzyMatcher`] or [`ImageCache`] where it
//! applies). Retries live in the API client and caching in the caches; the
//! facade only routes and propagates the first error.

mod builder;

pub use builder::GatewayBuilder;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::api::ApiClient;
use crate::background::BackgroundTask;
use crate::cache::{ContentKey, ImageCache, ImageFormat, RequestKey, ResponseCache};
use crate::config::Config;
use crate::fuzzy::{self, FuzzyMatcher, RankedTitle, TitleIndex};
use crate::rate_limit::RateLimiter;
use crate::token::TokenManager;
use crate::upstream::{
    self, ARCHIVE_PATH, Envelope, GAME_PARAM, GameSummary, ORG_PARAM, OrgSummary, SEARCH_GAME_PATH,
};
use crate::{GalcacheError, Result};

/// Cooldown key of [`Gateway::search()`].
pub const SEARCH_COMMAND: &str = "search";
/// Cooldown key of [`Gateway::fuzzy_lookup()`].
pub const FUZZY_COMMAND: &str = "fuzzy";
/// Cooldown key of [`Gateway::info()`].
pub const INFO_COMMAND: &str = "info";
/// Cooldown key of [`Gateway::fetch_image()`].
pub const IMAGE_COMMAND: &str = "image";
/// Cooldown key of [`Gateway::developer()`] and [`Gateway::developer_of()`].
pub const DEVELOPER_COMMAND: &str = "developer";

/// Candidates requested from the list search.
const LIST_PAGE_SIZE: usize = 20;

/// An image ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverImage {
    pub game_id: u64,
    pub key: ContentKey,
    pub format: ImageFormat,
    pub bytes: Vec<u8>,
}

/// What one manual sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub responses: usize,
    pub images: usize,
}

/// Rate-limited, cached access to the archive API.
pub struct Gateway {
    config: Arc<Config>,
    tokens: Arc<TokenManager>,
    api: ApiClient,
    responses: ResponseCache,
    images: ImageCache,
    matcher: FuzzyMatcher,
    limiter: RateLimiter,
}

impl Gateway {
    pub fn builder(config: Arc<Config>) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn responses(&self) -> &ResponseCache {
        &self.responses
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Exact title lookup. The score is the best match between `query` and
    /// the titles of the game found.
    #[instrument(skip(self), level = "debug")]
    pub async fn search(&self, user: &str, query: &str) -> Result<RankedTitle<GameSummary>> {
        self.limiter.try_acquire(user, SEARCH_COMMAND)?;

        let params = vec![
            ("mode", "accurate".to_string()),
            ("keyword", query.to_string()),
            ("similarity", self.config.similarity.to_string()),
        ];
        let data = self
            .cached(SEARCH_GAME_PATH, params, format!("game '{query}'"))
            .await?;
        let game = upstream::game_from_data(&data)?;
        let score = game
            .titles()
            .into_iter()
            .map(|title| fuzzy::score(query, title))
            .max()
            .unwrap_or(0);
        Ok(RankedTitle {
            title: game.title().to_string(),
            score,
            record: game,
        })
    }

    /// Ranked candidates for a loose query, best first.
    ///
    /// Fails with [`GalcacheError::NotFound`] when nothing clears the
    /// similarity floor.
    #[instrument(skip(self), level = "debug")]
    pub async fn fuzzy_lookup(&self, user: &str, query: &str) -> Result<Vec<RankedTitle<GameSummary>>> {
        self.limiter.try_acquire(user, FUZZY_COMMAND)?;

        let params = vec![
            ("mode", "list".to_string()),
            ("keyword", query.to_string()),
            ("pageNum", "1".to_string()),
            ("pageSize", LIST_PAGE_SIZE.to_string()),
        ];
        let data = self
            .cached(SEARCH_GAME_PATH, params, format!("games matching '{query}'"))
            .await?;
        let games = upstream::games_from_list(&data);
        let index: TitleIndex<GameSummary> = games
            .iter()
            .flat_map(|game| {
                game.titles()
                    .into_iter()
                    .map(move |title| (title.to_string(), game.clone()))
            })
            .collect();

        // A game indexed under two titles appears once, at its best score.
        let ranked = self
            .matcher
            .search_distinct(query, &index, |game| (game.game_id(), game.name.clone()))
            .await?;
        debug!(candidates = games.len(), matched = ranked.len(), "fuzzy lookup ranked");

        if ranked.is_empty() {
            return Err(GalcacheError::NotFound(format!("games matching '{query}'")));
        }
        Ok(ranked)
    }

    /// The archive record for game `gid` (the envelope's `data`).
    #[instrument(skip(self), level = "debug")]
    pub async fn info(&self, user: &str, gid: u64) -> Result<Arc<Value>> {
        self.limiter.try_acquire(user, INFO_COMMAND)?;
        self.archive(gid).await
    }

    /// The developer (organisation) record for `org_id`.
    #[instrument(skip(self), level = "debug")]
    pub async fn developer(&self, user: &str, org_id: u64) -> Result<OrgSummary> {
        self.limiter.try_acquire(user, DEVELOPER_COMMAND)?;
        self.org(org_id).await
    }

    /// The developer of game `gid`, read from the game's `developerId`.
    ///
    /// Fails with [`GalcacheError::NotFound`] when the game names no
    /// developer.
    #[instrument(skip(self), level = "debug")]
    pub async fn developer_of(&self, user: &str, gid: u64) -> Result<OrgSummary> {
        self.limiter.try_acquire(user, DEVELOPER_COMMAND)?;

        let data = self.archive(gid).await?;
        let game = upstream::game_from_data(&data)?;
        let org_id = game
            .developer_id
            .ok_or_else(|| GalcacheError::NotFound(format!("developer of game {gid}")))?;
        self.org(org_id).await
    }

    /// Cover image for game `gid`, served from the image cache when present.
    ///
    /// Payloads over `image.max_size_bytes` fail with
    /// [`GalcacheError::TooLarge`]; formats outside `image.formats` are
    /// rejected and never cached.
    #[instrument(skip(self), level = "debug")]
    pub async fn fetch_image(&self, user: &str, gid: u64) -> Result<CoverImage> {
        self.limiter.try_acquire(user, IMAGE_COMMAND)?;

        let data = self.archive(gid).await?;
        let game = upstream::game_from_data(&data)?;
        let url = game
            .main_img
            .filter(|url| !url.is_empty())
            .ok_or_else(|| GalcacheError::NotFound(format!("cover image for game {gid}")))?;
        let key = ContentKey::for_source(&url);
        let limit = self.images.config().admission_limit();

        let bytes = self
            .images
            .get_or_insert_with(&key, || async {
                let bytes = self.api.fetch_bytes(&url, limit).await?;
                self.accepted_format(&bytes)?;
                Ok(bytes)
            })
            .await?;
        let format = self.accepted_format(&bytes)?;
        Ok(CoverImage {
            game_id: gid,
            key,
            format,
            bytes,
        })
    }

    /// Purge expired responses and sweep the image directory now.
    pub async fn sweep(&self) -> SweepReport {
        SweepReport {
            responses: self.responses.purge_expired(),
            images: self.images.sweep().await,
        }
    }

    /// Start token refresh and both cache sweepers. Dropping the returned
    /// handles stops them.
    pub fn start_background(&self) -> Vec<BackgroundTask> {
        let sweep_period = self.config.cache.sweep_period();
        vec![
            self.tokens.spawn_refresh_task(),
            self.responses.spawn_sweeper(sweep_period),
            self.images.spawn_sweeper(sweep_period),
        ]
    }

    async fn archive(&self, gid: u64) -> Result<Arc<Value>> {
        let params = vec![(GAME_PARAM, gid.to_string())];
        self.cached(ARCHIVE_PATH, params, format!("game {gid}")).await
    }

    async fn org(&self, org_id: u64) -> Result<OrgSummary> {
        let params = vec![(ORG_PARAM, org_id.to_string())];
        let data = self
            .cached(ARCHIVE_PATH, params, format!("developer {org_id}"))
            .await?;
        upstream::org_from_data(&data)
    }

    /// Read `path` through the response cache, unwrapping the envelope.
    /// Envelope failures are shared with coalesced callers but not cached.
    async fn cached(
        &self,
        path: &'static str,
        params: Vec<(&'static str, String)>,
        what: String,
    ) -> Result<Arc<Value>> {
        let key = RequestKey::new(path, &params);
        let api = self.api.clone();
        self.responses
            .get_or_fetch(&key, move || async move {
                let body = api.fetch(path, &params).await?;
                Envelope::parse(body)?.into_data(&what)
            })
            .await
    }

    /// Sniffed format of `bytes` (`image.default_format` when unrecognised),
    /// if it is one of `image.formats`.
    fn accepted_format(&self, bytes: &[u8]) -> Result<ImageFormat> {
        let image = &self.config.image;
        let format = ImageFormat::sniff(bytes)
            .or_else(|| ImageFormat::from_extension(&image.default_format))
            .ok_or_else(|| {
                GalcacheError::Config(format!("unknown image format '{}'", image.default_format))
            })?;
        let accepted = image
            .formats
            .iter()
            .any(|f| ImageFormat::from_extension(f) == Some(format));
        if accepted {
            Ok(format)
        } else {
            Err(GalcacheError::Malformed(format!("image format {format} is not accepted")))
        }
    }
}

//! galcache - resource-bounded access layer for the YMGal archive API
//!
//! The crate sits between a chat frontend and the upstream API and keeps
//! every resource it touches bounded: upstream calls (retries, deadlines,
//! bearer tokens), memory (a TTL response cache with single-flight fetches),
//! disk (a size- and age-capped image cache) and per-user command rates.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use galcache::{Config, Gateway};
//!
//! #[tokio::main]
//! async fn main() -> galcache::Result<()> {
//!     let config = Config::load(None, std::env::vars())?;
//!     let gateway = Gateway::builder(Arc::new(config)).build().await?;
//!     let _background = gateway.start_background();
//!
//!     let hit = gateway.search("user-1", "CLANNAD").await?;
//!     println!("{} ({}%)", hit.title, hit.score);
//!
//!     for hit in gateway.fuzzy_lookup("user-1", "fate").await? {
//!         println!("{:>3}  {}", hit.score, hit.title);
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod background;
pub mod cache;
pub mod config;
pub mod error;
pub mod fuzzy;
pub mod gateway;
pub mod rate_limit;
pub mod telemetry;
pub mod token;
pub mod upstream;

// Re-export main types at crate root
pub use api::{ApiClient, RetryConfig};
pub use background::BackgroundTask;
pub use cache::{
    CacheStats, ContentKey, ImageCache, ImageCacheConfig, ImageFormat, ImageRecord, RequestKey,
    ResponseCache, ResponseCacheConfig,
};
pub use config::{Config, CooldownRule, FileFormat};
pub use error::{GalcacheError, Result};
pub use fuzzy::{FuzzyMatcher, MatchOptions, RankedTitle, TitleIndex};
pub use gateway::{CoverImage, Gateway, GatewayBuilder, SweepReport};
pub use rate_limit::RateLimiter;
pub use token::{AuthToken, OAuthTokenSource, TokenManager, TokenPhase, TokenSource};
pub use upstream::{GameSummary, OrgSummary};

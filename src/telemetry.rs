//! Telemetry metric name constants.
//!
//! Consumers install their own `metrics` recorder (e.g. prometheus,
//! statsd); without a recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `galcache_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `cache`: which cache emitted the event: "response" or "image"
//! - `command`: facade command name (e.g. "search", "fuzzy")
//! - `status`: outcome: "ok" or "error"

/// Total upstream requests (one per attempt).
///
/// Labels: `status` ("ok" | "error").
pub const UPSTREAM_REQUESTS_TOTAL: &str = "galcache_upstream_requests_total";

/// Total retry attempts (not counting the initial request).
pub const UPSTREAM_RETRIES_TOTAL: &str = "galcache_upstream_retries_total";

/// Total token refreshes.
///
/// Labels: `status` ("ok" | "error").
pub const TOKEN_REFRESHES_TOTAL: &str = "galcache_token_refreshes_total";

/// Total cache hits.
///
/// Labels: `cache`.
pub const CACHE_HITS_TOTAL: &str = "galcache_cache_hits_total";

/// Total cache misses.
///
/// Labels: `cache`.
pub const CACHE_MISSES_TOTAL: &str = "galcache_cache_misses_total";

/// Total entries evicted for capacity or age.
///
/// Labels: `cache`, `reason` ("capacity" | "expired").
pub const CACHE_EVICTIONS_TOTAL: &str = "galcache_cache_evictions_total";

/// Total commands rejected by the cooldown limiter.
///
/// Labels: `command`.
pub const RATE_LIMITED_TOTAL: &str = "galcache_rate_limited_total";

//! Caching subsystem.
//!
//! Two independent caches:
//!
//! - [`response::ResponseCache`]: in-memory TTL cache for upstream JSON,
//!   bounded by entry count, with single-flight fetches.
//! - [`image::ImageCache`]: on-disk store for downloaded images, bounded by
//!   total bytes and age, with atomic writes and per-key locking.

pub mod image;
pub mod response;

pub use image::{ContentKey, ImageCache, ImageCacheConfig, ImageFormat, ImageRecord};
pub use response::{RequestKey, ResponseCache, ResponseCacheConfig};

/// Point-in-time counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Serialized size for the response cache, file bytes for the image cache.
    pub bytes: u64,
}

impl CacheStats {
    /// Hits over lookups, or 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

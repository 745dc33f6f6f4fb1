//! On-disk image store.
//!
//! Images live as `<dir>/<content key>.<ext>`, where the content key is the
//! SHA-256 of the source URL. An in-memory index tracks one
//! [`ImageRecord`] per file and the running byte total.
//!
//! # Consistency
//!
//! - Writes stage to `<key>.tmp` and are renamed into place before the
//!   record is registered.
//! - Removal deletes the file before unregistering the record.
//! - Every mutation of a key holds that key's async lock. The sweep holds
//!   the index lock only while choosing candidates.
//!
//! # Bounds
//!
//! A single image may not exceed `max_image_bytes`. When the total exceeds
//! `max_total_bytes`, records are evicted oldest `fetched_at` first. The
//! periodic sweep drops records fetched more than `max_age` ago, however
//! recently they were read.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as KeyMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::CacheStats;
use crate::background::BackgroundTask;
use crate::config::Config;
use crate::telemetry;
use crate::{GalcacheError, Result};

/// Suffix of staging files.
const TMP_SUFFIX: &str = "tmp";

/// Stable identifier of a cached image: lowercase hex SHA-256 of its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn for_source(source: &str) -> Self {
        Self(format!("{:x}", Sha256::digest(source.as_bytes())))
    }

    /// Accept an existing key, e.g. a file stem found on disk.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Image encodings recognised by their magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Jpg,
    Png,
    Webp,
    Gif,
}

impl ImageFormat {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [0xFF, 0xD8, 0xFF, ..] => Some(Self::Jpg),
            [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(Self::Png),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(Self::Webp),
            [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(Self::Gif),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Index entry for one file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub content_key: ContentKey,
    pub file_path: PathBuf,
    pub byte_size: u64,
    pub fetched_at: SystemTime,
    pub last_accessed_at: SystemTime,
}

/// Location and bounds of an [`ImageCache`].
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    pub dir: PathBuf,
    pub max_image_bytes: u64,
    pub max_total_bytes: u64,
    pub max_age: Duration,
    /// Extension used when the payload's format cannot be sniffed.
    pub default_extension: String,
}

impl ImageCacheConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dir: config.image_dir(),
            max_image_bytes: config.image.max_size_bytes,
            max_total_bytes: config.cache.image_max_bytes(),
            max_age: config.cache.image_max_age(),
            default_extension: config.image.default_format.to_ascii_lowercase(),
        }
    }

    /// Largest payload [`ImageCache::put()`] accepts.
    pub fn admission_limit(&self) -> u64 {
        self.max_image_bytes.min(self.max_total_bytes)
    }
}

#[derive(Default)]
struct Index {
    records: HashMap<ContentKey, ImageRecord>,
    total_bytes: u64,
    hits: u64,
    misses: u64,
}

impl Index {
    fn register(&mut self, record: ImageRecord) {
        self.total_bytes += record.byte_size;
        if let Some(old) = self.records.insert(record.content_key.clone(), record) {
            self.total_bytes -= old.byte_size;
        }
    }

    fn unregister(&mut self, key: &ContentKey) -> Option<ImageRecord> {
        let record = self.records.remove(key)?;
        self.total_bytes -= record.byte_size;
        Some(record)
    }

    /// Keys ordered by `fetched_at`, oldest first.
    fn oldest_first(&self) -> Vec<ContentKey> {
        let mut keys: Vec<_> = self
            .records
            .values()
            .map(|r| (r.fetched_at, r.content_key.clone()))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, key)| key).collect()
    }
}

struct Inner {
    config: ImageCacheConfig,
    index: Mutex<Index>,
    key_locks: Mutex<HashMap<ContentKey, Arc<KeyMutex<()>>>>,
}

impl Inner {
    fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_lock(&self, key: &ContentKey) -> Arc<KeyMutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Drop the lock entry for `key` once nobody holds or awaits it.
    fn prune_key_lock(&self, key: &ContentKey) {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }
}

/// Exclusive hold on one content key.
struct KeyGuard<'a> {
    inner: &'a Inner,
    key: ContentKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.inner.prune_key_lock(&self.key);
    }
}

/// Size- and age-bounded on-disk image cache.
///
/// Cheap to clone; clones share the index.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

impl ImageCache {
    /// Open the cache directory, creating it if needed.
    ///
    /// Files already present are indexed (`fetched_at` from their mtime),
    /// leftover staging files are deleted, and the size cap is enforced.
    pub async fn open(config: ImageCacheConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.dir)
            .await
            .map_err(|e| GalcacheError::io(format!("create {}", config.dir.display()), e))?;

        let mut index = Index::default();
        let mut leftovers = 0usize;
        let mut entries = tokio::fs::read_dir(&config.dir)
            .await
            .map_err(|e| GalcacheError::io(format!("read {}", config.dir.display()), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GalcacheError::io(format!("read {}", config.dir.display()), e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == TMP_SUFFIX) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to delete staging file");
                }
                leftovers += 1;
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(ContentKey::parse)
            else {
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            if index.records.contains_key(&key) {
                // Same key under another extension; keep the first one seen.
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to delete duplicate image");
                }
                continue;
            }
            let fetched_at = metadata.modified().unwrap_or_else(|_| SystemTime::now());
            index.register(ImageRecord {
                content_key: key,
                file_path: path,
                byte_size: metadata.len(),
                fetched_at,
                last_accessed_at: fetched_at,
            });
        }

        info!(
            dir = %config.dir.display(),
            images = index.records.len(),
            bytes = index.total_bytes,
            leftovers,
            "opened image cache"
        );
        let cache = Self {
            inner: Arc::new(Inner {
                config,
                index: Mutex::new(index),
                key_locks: Mutex::new(HashMap::new()),
            }),
        };
        cache.enforce_size_cap(None, 0).await;
        Ok(cache)
    }

    pub fn config(&self) -> &ImageCacheConfig {
        &self.inner.config
    }

    /// Store `bytes` under `key`.
    ///
    /// Fails with [`GalcacheError::TooLarge`] before touching disk when the
    /// payload exceeds the single-image limit. If the key is already cached
    /// this is a no-op returning the existing record.
    pub async fn put(&self, key: &ContentKey, bytes: &[u8]) -> Result<ImageRecord> {
        let limit = self.inner.config.admission_limit();
        let size = bytes.len() as u64;
        if size > limit {
            return Err(GalcacheError::TooLarge { size, limit });
        }
        let _guard = self.lock_key(key).await;
        self.put_locked(key, bytes).await
    }

    /// Read the image for `key`, updating its access time.
    ///
    /// A record whose file has vanished is dropped and reported as a miss.
    pub async fn get(&self, key: &ContentKey) -> Option<Vec<u8>> {
        let path = {
            let mut index = self.inner.index();
            match index.records.get_mut(key) {
                Some(record) => {
                    record.last_accessed_at = SystemTime::now();
                    Some(record.file_path.clone())
                }
                None => None,
            }
        };
        let Some(path) = path else {
            self.record_lookup(false);
            return None;
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                self.record_lookup(true);
                Some(bytes)
            }
            Err(e) => {
                if e.kind() == ErrorKind::NotFound {
                    let mut index = self.inner.index();
                    if index.records.get(key).is_some_and(|r| r.file_path == path) {
                        index.unregister(key);
                    }
                }
                warn!(key = %key, error = %e, "cached image unreadable");
                self.record_lookup(false);
                None
            }
        }
    }

    /// Return the cached image, or download it with `fetch` and cache it.
    ///
    /// The key lock is held across the download, so concurrent misses on
    /// one key fetch once. A cache write that fails with an I/O error still
    /// returns the downloaded bytes.
    pub async fn get_or_insert_with<F, Fut>(&self, key: &ContentKey, fetch: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        if let Some(bytes) = self.get(key).await {
            return Ok(bytes);
        }
        let _guard = self.lock_key(key).await;
        if self.record(key).is_some() {
            if let Some(bytes) = self.get(key).await {
                return Ok(bytes);
            }
        }

        let bytes = fetch().await?;
        match self.put_locked(key, &bytes).await {
            Ok(_) => {}
            Err(e @ GalcacheError::TooLarge { .. }) => return Err(e),
            Err(e) => warn!(key = %key, error = %e, "image cache write failed, serving uncached"),
        }
        Ok(bytes)
    }

    /// Delete the image for `key`. Returns whether one was cached.
    pub async fn remove(&self, key: &ContentKey) -> Result<bool> {
        let _guard = self.lock_key(key).await;
        self.remove_locked(key).await
    }

    /// Drop everything fetched more than `max_age` ago, then enforce the
    /// size cap. Returns the number of images removed.
    pub async fn sweep(&self) -> usize {
        self.sweep_expired_at(SystemTime::now()).await
    }

    /// [`sweep()`](Self::sweep) as of `now`.
    pub async fn sweep_expired_at(&self, now: SystemTime) -> usize {
        let max_age = self.inner.config.max_age;
        let candidates: Vec<ContentKey> = {
            let index = self.inner.index();
            index
                .records
                .values()
                .filter(|r| is_expired(r, now, max_age))
                .map(|r| r.content_key.clone())
                .collect()
        };

        let mut expired = 0;
        for key in candidates {
            let _guard = self.lock_key(&key).await;
            let still_expired = self
                .record(&key)
                .is_some_and(|r| is_expired(&r, now, max_age));
            if !still_expired {
                continue;
            }
            match self.remove_locked(&key).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "failed to remove expired image"),
            }
        }
        if expired > 0 {
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "cache" => "image", "reason" => "expired")
                .increment(expired as u64);
        }

        let evicted = self.enforce_size_cap(None, 0).await;
        let stats = self.stats();
        debug!(
            expired,
            evicted,
            images = stats.entries,
            bytes = stats.bytes,
            hit_rate = stats.hit_rate(),
            "image cache swept"
        );
        expired + evicted
    }

    /// Snapshot of the record for `key`.
    pub fn record(&self, key: &ContentKey) -> Option<ImageRecord> {
        self.inner.index().records.get(key).cloned()
    }

    /// Snapshot of every record.
    pub fn records(&self) -> Vec<ImageRecord> {
        self.inner.index().records.values().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.inner.index();
        CacheStats {
            entries: index.records.len(),
            hits: index.hits,
            misses: index.misses,
            bytes: index.total_bytes,
        }
    }

    /// Run [`sweep()`](Self::sweep) every `period`.
    pub fn spawn_sweeper(&self, period: Duration) -> BackgroundTask {
        let cache = self.clone();
        BackgroundTask::spawn_periodic("image-cache-sweep", period, move || {
            let cache = cache.clone();
            async move {
                cache.sweep().await;
            }
        })
    }

    async fn lock_key(&self, key: &ContentKey) -> KeyGuard<'_> {
        let lock = self.inner.key_lock(key);
        let guard = lock.lock_owned().await;
        KeyGuard {
            inner: &self.inner,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Non-blocking variant for eviction, which must not wait on a key
    /// another writer holds.
    fn try_lock_key(&self, key: &ContentKey) -> Option<KeyGuard<'_>> {
        let lock = self.inner.key_lock(key);
        match lock.try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                inner: &self.inner,
                key: key.clone(),
                guard: Some(guard),
            }),
            Err(_) => None,
        }
    }

    /// Write, rename and register. Caller holds the key lock.
    async fn put_locked(&self, key: &ContentKey, bytes: &[u8]) -> Result<ImageRecord> {
        let config = &self.inner.config;
        let limit = config.admission_limit();
        let size = bytes.len() as u64;
        if size > limit {
            return Err(GalcacheError::TooLarge { size, limit });
        }
        if let Some(existing) = self.record(key) {
            debug!(key = %key, "image already cached");
            return Ok(existing);
        }

        let ext = ImageFormat::sniff(bytes)
            .map(|format| format.extension().to_string())
            .unwrap_or_else(|| config.default_extension.clone());
        let path = config.dir.join(format!("{key}.{ext}"));
        let tmp_path = config.dir.join(format!("{key}.{TMP_SUFFIX}"));

        tokio::fs::create_dir_all(&config.dir)
            .await
            .map_err(|e| GalcacheError::io(format!("create {}", config.dir.display()), e))?;
        self.enforce_size_cap(Some(key), size).await;
        if let Err(e) = write_atomic(&tmp_path, &path, bytes).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        let now = SystemTime::now();
        let record = ImageRecord {
            content_key: key.clone(),
            file_path: path,
            byte_size: size,
            fetched_at: now,
            last_accessed_at: now,
        };
        self.inner.index().register(record.clone());
        debug!(key = %key, bytes = size, "cached image");

        // Room was made up front; this only catches concurrent inserts.
        self.enforce_size_cap(Some(key), 0).await;
        Ok(record)
    }

    /// Delete then unregister. Caller holds the key lock.
    async fn remove_locked(&self, key: &ContentKey) -> Result<bool> {
        let Some(record) = self.record(key) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&record.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(GalcacheError::io(
                    format!("remove {}", record.file_path.display()),
                    e,
                ));
            }
        }
        Ok(self.inner.index().unregister(key).is_some())
    }

    /// Evict oldest-fetched images until the total plus `incoming` bytes
    /// fits the cap. Skips `keep` and any key currently locked by a writer.
    async fn enforce_size_cap(&self, keep: Option<&ContentKey>, incoming: u64) -> usize {
        let budget = self.inner.config.max_total_bytes.saturating_sub(incoming);
        let candidates = {
            let index = self.inner.index();
            if index.total_bytes <= budget {
                return 0;
            }
            index.oldest_first()
        };

        let mut evicted = 0;
        for key in candidates {
            if self.inner.index().total_bytes <= budget {
                break;
            }
            if keep == Some(&key) {
                continue;
            }
            let Some(_guard) = self.try_lock_key(&key) else {
                debug!(key = %key, "image busy, skipping eviction");
                continue;
            };
            match self.remove_locked(&key).await {
                Ok(true) => {
                    evicted += 1;
                    debug!(key = %key, "evicted image over size cap");
                }
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "failed to evict image"),
            }
        }
        if evicted > 0 {
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "cache" => "image", "reason" => "capacity")
                .increment(evicted as u64);
        }
        evicted
    }

    fn record_lookup(&self, hit: bool) {
        let mut index = self.inner.index();
        if hit {
            index.hits += 1;
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "cache" => "image").increment(1);
        } else {
            index.misses += 1;
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "cache" => "image").increment(1);
        }
    }
}

fn is_expired(record: &ImageRecord, now: SystemTime, max_age: Duration) -> bool {
    now.duration_since(record.fetched_at)
        .is_ok_and(|age| age > max_age)
}

/// Stage `bytes` in `tmp_path`, flush them to disk, then rename into place.
async fn write_atomic(tmp_path: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let staged = async {
        let mut file = tokio::fs::File::create(tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    };
    staged
        .await
        .map_err(|e| GalcacheError::io(format!("write {}", tmp_path.display()), e))?;
    tokio::fs::rename(tmp_path, path).await.map_err(|e| {
        GalcacheError::io(
            format!("rename {} → {}", tmp_path.display(), path.display()),
            e,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_key_is_sha256_hex() {
        let key = ContentKey::for_source("https://example.com/a.jpg");
        assert_eq!(key.as_str().len(), 64);
        assert_eq!(ContentKey::parse(key.as_str()), Some(key));
        assert_eq!(ContentKey::parse("not-a-key"), None);
        assert_eq!(ContentKey::parse(&"A".repeat(64)), None);
    }

    #[test]
    fn sniffs_magic_bytes() {
        assert_eq!(ImageFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageFormat::Jpg));
        assert_eq!(
            ImageFormat::sniff(b"\x89PNG\r\n\x1a\n...."),
            Some(ImageFormat::Png)
        );
        assert_eq!(ImageFormat::sniff(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageFormat::Webp));
        assert_eq!(ImageFormat::sniff(b"GIF89a"), Some(ImageFormat::Gif));
        assert_eq!(ImageFormat::sniff(b"<html>"), None);
        assert_eq!(ImageFormat::from_extension("JPEG"), Some(ImageFormat::Jpg));
    }

    #[tokio::test]
    async fn write_atomic_leaves_only_the_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("k.tmp");
        let path = dir.path().join("k.jpg");
        write_atomic(&tmp, &path, b"payload").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn room_is_made_before_the_incoming_write() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(ImageCacheConfig {
            dir: dir.path().to_path_buf(),
            max_image_bytes: 1_000,
            max_total_bytes: 1_000,
            max_age: Duration::from_secs(3600),
            default_extension: "jpg".to_string(),
        })
        .await
        .unwrap();
        let (a, b) = (ContentKey::for_source("a"), ContentKey::for_source("b"));
        let a_record = cache.put(&a, &[0xFF; 400]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.put(&b, &[0xFF; 400]).await.unwrap();

        // Reserving 400 more bytes must push out the oldest image now.
        assert_eq!(cache.enforce_size_cap(None, 400).await, 1);
        assert!(!a_record.file_path.exists());
        assert!(cache.record(&b).is_some());
        assert_eq!(cache.stats().bytes, 400);

        // Nothing to do once the reservation fits.
        assert_eq!(cache.enforce_size_cap(None, 600).await, 0);
    }

    #[test]
    fn expiry_uses_fetched_at() {
        let fetched_at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let record = ImageRecord {
            content_key: ContentKey::for_source("x"),
            file_path: PathBuf::from("x.jpg"),
            byte_size: 1,
            fetched_at,
            last_accessed_at: fetched_at + Duration::from_secs(500),
        };
        let max_age = Duration::from_secs(100);
        assert!(!is_expired(&record, fetched_at + Duration::from_secs(100), max_age));
        assert!(is_expired(&record, fetched_at + Duration::from_secs(101), max_age));
    }
}

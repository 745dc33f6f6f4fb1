//! In-memory TTL cache for upstream JSON responses.
//!
//! [`ResponseCache`] maps a [`RequestKey`] (path plus sorted query
//! parameters) to the parsed response body.
//!
//! # Eviction
//!
//! Entries expire `ttl` after insertion. Expired entries are misses; they
//! are dropped lazily on lookup and in bulk by [`ResponseCache::purge_expired()`].
//! When the cache is full, the entry inserted earliest goes first, whether
//! or not it was read recently. Because every entry shares one TTL,
//! insertion order is also expiry order.
//!
//! # Single-flight
//!
//! [`ResponseCache::get_or_fetch()`] coalesces concurrent misses on one key
//! into a single fetch. The fetch runs inside a shared future bounded by the
//! request deadline; every waiter observes the same value or the same error,
//! and the cache is written once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::CacheStats;
use crate::background::{BackgroundTask, deadline_after};
use crate::config::Config;
use crate::telemetry;
use crate::{GalcacheError, Result};

/// Normalized request signature: path plus query parameters sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(path: &str, params: &[(&str, String)]) -> Self {
        let mut sorted: Vec<_> = params.iter().collect();
        sorted.sort();
        let mut key = path.to_string();
        for (i, (name, value)) in sorted.into_iter().enumerate() {
            key.push(if i == 0 { '?' } else { '&' });
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bounds for a [`ResponseCache`].
///
/// ```rust
/// # use galcache::cache::ResponseCacheConfig;
/// # use std::time::Duration;
/// let config = ResponseCacheConfig::new()
///     .max_entries(64)
///     .ttl(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    /// Maximum number of cached entries. Default: 128.
    pub max_entries: usize,
    /// Time-to-live from insertion. Default: 1 hour.
    pub ttl: Duration,
    /// Deadline for one coalesced fetch. Default: 2 minutes.
    pub deadline: Duration,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 128,
            ttl: Duration::from_secs(3600),
            deadline: Duration::from_secs(120),
        }
    }
}

impl ResponseCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds from `cache.*`, deadline from the retry budget.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_entries: config.cache.api_max_entries,
            ttl: config.cache.api_ttl(),
            deadline: config.request_deadline(),
        }
    }

    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n.max(1);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

struct CacheEntry {
    value: Arc<Value>,
    inserted_at: Instant,
    expires_at: Instant,
    size_hint: usize,
    /// Position in insertion order.
    seq: u64,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Value>>>>;

#[derive(Default)]
struct State {
    entries: HashMap<RequestKey, CacheEntry>,
    /// seq → key, oldest first.
    order: BTreeMap<u64, RequestKey>,
    next_seq: u64,
    in_flight: HashMap<RequestKey, SharedFetch>,
    bytes: u64,
    hits: u64,
    misses: u64,
}

impl State {
    fn lookup(&mut self, key: &RequestKey, now: Instant) -> Option<Arc<Value>> {
        let expired = match self.entries.get(key) {
            Some(entry) if now < entry.expires_at => return Some(Arc::clone(&entry.value)),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.remove(key);
        }
        None
    }

    fn remove(&mut self, key: &RequestKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        self.bytes -= entry.size_hint as u64;
        Some(entry)
    }

    fn insert(&mut self, key: RequestKey, value: Arc<Value>, size_hint: usize, config: &ResponseCacheConfig) {
        self.remove(&key);
        while self.entries.len() >= config.max_entries {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.bytes -= entry.size_hint as u64;
                debug!(key = %oldest, age = ?entry.inserted_at.elapsed(), "evicted oldest response");
            }
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "cache" => "response", "reason" => "capacity")
                .increment(1);
        }

        let now = Instant::now();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.bytes += size_hint as u64;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: deadline_after(now, config.ttl),
                size_hint,
                seq,
            },
        );
    }
}

struct Inner {
    config: ResponseCacheConfig,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finish a coalesced fetch: clear the in-flight marker and store the
    /// value. A value that cannot be sized is returned uncached.
    fn complete(&self, key: &RequestKey, outcome: Result<Value>) -> Result<Arc<Value>> {
        let value = match outcome {
            Ok(value) => Arc::new(value),
            Err(e) => {
                self.state().in_flight.remove(key);
                return Err(e);
            }
        };
        let size_hint = serde_json::to_vec(&*value).map(|bytes| bytes.len());

        let mut state = self.state();
        state.in_flight.remove(key);
        match size_hint {
            Ok(size_hint) => state.insert(key.clone(), Arc::clone(&value), size_hint, &self.config),
            Err(e) => warn!(key = %key, error = %e, "response not cacheable, serving uncached"),
        }
        Ok(value)
    }
}

/// Bounded, TTL-expiring, single-flight cache of upstream JSON responses.
///
/// Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<Inner>,
}

impl ResponseCache {
    pub fn new(config: ResponseCacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn config(&self) -> &ResponseCacheConfig {
        &self.inner.config
    }

    /// Look up a live entry. Emits hit/miss metrics.
    pub fn get(&self, key: &RequestKey) -> Option<Arc<Value>> {
        let mut state = self.inner.state();
        let found = state.lookup(key, Instant::now());
        record_lookup(&mut state, found.is_some());
        found
    }

    /// Store a value directly, bypassing single-flight.
    pub fn insert(&self, key: RequestKey, value: Value) -> Result<()> {
        let size_hint = serde_json::to_vec(&value)?.len();
        self.inner
            .state()
            .insert(key, Arc::new(value), size_hint, &self.inner.config);
        Ok(())
    }

    /// Return the live entry, or run `fetch` (once, however many callers
    /// are waiting) and cache its result.
    ///
    /// Failures are shared with every waiter and are not cached. If the
    /// fetch outlives the deadline all waiters receive
    /// [`GalcacheError::Timeout`].
    pub async fn get_or_fetch<F, Fut>(&self, key: &RequestKey, fetch: F) -> Result<Arc<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let shared = {
            let mut state = self.inner.state();
            let found = state.lookup(key, Instant::now());
            record_lookup(&mut state, found.is_some());
            if let Some(value) = found {
                return Ok(value);
            }

            match state.in_flight.get(key) {
                Some(pending) => {
                    debug!(key = %key, "joining in-flight fetch");
                    pending.clone()
                }
                None => {
                    let pending = self.start_fetch(key.clone(), fetch());
                    state.in_flight.insert(key.clone(), pending.clone());
                    pending
                }
            }
        };
        shared.await
    }

    fn start_fetch<Fut>(&self, key: RequestKey, fetch: Fut) -> SharedFetch
    where
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let deadline = inner.config.deadline;
        async move {
            let outcome = match tokio::time::timeout(deadline, fetch).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(key = %key, ?deadline, "response fetch exceeded its deadline");
                    Err(GalcacheError::Timeout(deadline))
                }
            };
            inner.complete(&key, outcome)
        }
        .boxed()
        .shared()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state();
        let mut purged = 0;
        while let Some((&seq, key)) = state.order.first_key_value() {
            if state.entries.get(key).is_some_and(|entry| entry.expires_at > now) {
                break;
            }
            let key = key.clone();
            if state.remove(&key).is_none() {
                state.order.remove(&seq);
            }
            purged += 1;
        }
        if purged > 0 {
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "cache" => "response", "reason" => "expired")
                .increment(purged as u64);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries. In-flight fetches still complete and insert.
    pub fn clear(&self) {
        let mut state = self.inner.state();
        state.entries.clear();
        state.order.clear();
        state.bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state();
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            bytes: state.bytes,
        }
    }

    /// Purge expired entries every `period`.
    pub fn spawn_sweeper(&self, period: Duration) -> BackgroundTask {
        let cache = self.clone();
        BackgroundTask::spawn_periodic("response-cache-sweep", period, move || {
            let cache = cache.clone();
            async move {
                let purged = cache.purge_expired();
                let stats = cache.stats();
                debug!(
                    purged,
                    entries = stats.entries,
                    hit_rate = stats.hit_rate(),
                    "response cache swept"
                );
            }
        })
    }
}

fn record_lookup(state: &mut State, hit: bool) {
    if hit {
        state.hits += 1;
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "cache" => "response").increment(1);
    } else {
        state.misses += 1;
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "cache" => "response").increment(1);
    }
}

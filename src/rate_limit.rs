//! Per-user, per-command cooldowns.
//!
//! Each `(user, command)` pair gets a token bucket holding up to `rate`
//! tokens and refilling at `rate / per` tokens per second. Refill is
//! computed lazily on each acquisition. Buckets start full and are dropped
//! after sitting idle for the longest configured window, by which time
//! they would have refilled anyway.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use moka::sync::Cache;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{Config, CooldownRule};
use crate::telemetry;
use crate::{GalcacheError, Result};

/// Token bucket for one `(user, command)` pair.
#[derive(Debug)]
pub struct RateBucket {
    rule: CooldownRule,
    tokens: f64,
    last_refill_at: Instant,
}

impl RateBucket {
    /// A full bucket.
    pub fn new(rule: CooldownRule) -> Self {
        Self {
            rule,
            tokens: f64::from(rule.rate),
            last_refill_at: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill_at).as_secs_f64();
        let rate = f64::from(self.rule.rate);
        self.tokens = (self.tokens + elapsed * rate / self.rule.per as f64).min(rate);
        self.last_refill_at = now;
    }

    /// Take one token, or report how long until one is available.
    pub fn try_consume(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - self.tokens) * self.rule.per as f64 / f64::from(self.rule.rate);
            Err(Duration::from_secs_f64(wait))
        }
    }

    /// Tokens available now.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    user: String,
    command: String,
}

/// Cooldown enforcement for facade commands.
pub struct RateLimiter {
    policies: BTreeMap<String, CooldownRule>,
    buckets: Cache<BucketKey, Arc<Mutex<RateBucket>>>,
}

impl RateLimiter {
    pub fn new(policies: BTreeMap<String, CooldownRule>) -> Self {
        let idle = policies
            .values()
            .map(CooldownRule::window)
            .max()
            .unwrap_or(Duration::from_secs(60));
        Self {
            policies,
            buckets: Cache::builder().time_to_idle(idle).build(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cooldown.clone())
    }

    pub fn policy(&self, command: &str) -> Option<&CooldownRule> {
        self.policies.get(command)
    }

    /// Admit one use of `command` by `user`.
    ///
    /// Commands without a policy are always admitted. A rejection carries
    /// the time until the next token.
    pub fn try_acquire(&self, user: &str, command: &str) -> Result<()> {
        let Some(rule) = self.policies.get(command).copied() else {
            return Ok(());
        };
        let bucket = self.bucket(user, command, rule);
        let outcome = bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_consume();

        outcome.map_err(|retry_after| {
            debug!(user, command, retry_after_ms = retry_after.as_millis() as u64, "command on cooldown");
            metrics::counter!(telemetry::RATE_LIMITED_TOTAL, "command" => command.to_string())
                .increment(1);
            GalcacheError::RateLimited {
                command: command.to_string(),
                retry_after,
            }
        })
    }

    /// Tokens `user` has left for `command`, or `None` when unthrottled.
    pub fn available(&self, user: &str, command: &str) -> Option<f64> {
        let rule = self.policies.get(command).copied()?;
        let bucket = self.bucket(user, command, rule);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        Some(bucket.available())
    }

    fn bucket(&self, user: &str, command: &str, rule: CooldownRule) -> Arc<Mutex<RateBucket>> {
        let key = BucketKey {
            user: user.to_string(),
            command: command.to_string(),
        };
        self.buckets
            .get_with(key, || Arc::new(Mutex::new(RateBucket::new(rule))))
    }
}

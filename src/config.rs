//! Configuration loading.
//!
//! A [`Config`] is built once at startup from three layers, later layers
//! winning:
//! 1. built-in defaults
//! 2. a config file (`config.json`, or TOML when the extension is `.toml`)
//! 3. environment overrides (`GALCACHE_` prefix, `__` between nesting levels)
//!
//! ```text
//! GALCACHE_SIMILARITY=80
//! GALCACHE_API__TIMEOUT=10
//! GALCACHE_COOLDOWN__SEARCH__RATE=3
//! ```
//!
//! The environment is handed in by the caller; nothing in the library reads
//! `std::env` itself. The result is validated and then treated as immutable:
//! share it behind an `Arc` and rebuild it to change anything.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{GalcacheError, Result};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "GALCACHE_";

/// Separator between nesting levels in environment override names.
const ENV_SEPARATOR: &str = "__";

/// File name of the config inside `cache_dir`.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Bytes per configured megabyte of image cache.
const BYTES_PER_MB: u64 = 1_000_000;

/// Upper bound for every duration setting: one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 3600;

/// Upper bound for `max_retries`.
pub const MAX_ATTEMPTS: u32 = 10;

/// Format of a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    /// Pick the format from a file extension (`.toml` → TOML, anything else → JSON).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => FileFormat::Toml,
            _ => FileFormat::Json,
        }
    }
}

/// Validated, immutable snapshot of every tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Fuzzy acceptance floor (0–100). Also sent upstream on accurate search.
    #[serde(default = "default_similarity")]
    pub similarity: u8,
    /// Root for on-disk caches.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Minutes between proactive token refreshes.
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval: u64,
    /// Total upstream attempts per request (1 = no retry).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Per-command cooldown rules, keyed on command name.
    #[serde(default = "default_cooldowns")]
    pub cooldown: BTreeMap<String, CooldownRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            similarity: default_similarity(),
            cache_dir: default_cache_dir(),
            token_refresh_interval: default_token_refresh_interval(),
            max_retries: default_max_retries(),
            api: ApiConfig::default(),
            image: ImageConfig::default(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
            cooldown: default_cooldowns(),
        }
    }
}

fn default_similarity() -> u8 {
    70
}

/// Default cache root: `~/.cache/galcache`.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("galcache")
}

fn default_token_refresh_interval() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_cooldowns() -> BTreeMap<String, CooldownRule> {
    [
        ("search", CooldownRule::new(1, 5)),
        ("fuzzy", CooldownRule::new(1, 10)),
        ("info", CooldownRule::new(1, 5)),
        ("image", CooldownRule::new(1, 5)),
        ("developer", CooldownRule::new(1, 5)),
    ]
    .into_iter()
    .map(|(name, rule)| (name.to_string(), rule))
    .collect()
}

/// Upstream API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-attempt deadline in seconds.
    #[serde(default = "default_api_timeout")]
    pub timeout: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// OAuth client id. Required.
    #[serde(default)]
    pub client_id: Option<String>,
    /// OAuth client secret. Required.
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_api_timeout(),
            user_agent: default_user_agent(),
            client_id: None,
            client_secret: None,
        }
    }
}

impl ApiConfig {
    /// Per-attempt deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

fn default_base_url() -> String {
    "https://www.ymgal.games".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("galcache/{}", env!("CARGO_PKG_VERSION"))
}

/// Image download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Single downloads larger than this are rejected.
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
    #[serde(default = "default_format")]
    pub default_format: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            formats: default_formats(),
            default_format: default_format(),
        }
    }
}

fn default_max_size_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_formats() -> Vec<String> {
    vec!["jpg".to_string(), "png".to_string(), "webp".to_string()]
}

fn default_format() -> String {
    "jpg".to_string()
}

/// Search and ranking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: u8,
    /// Scoring budget in seconds.
    #[serde(default = "default_fuzzy_timeout")]
    pub fuzzy_timeout: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            min_similarity: default_min_similarity(),
            fuzzy_timeout: default_fuzzy_timeout(),
        }
    }
}

impl SearchConfig {
    pub fn fuzzy_budget(&self) -> Duration {
        Duration::from_secs(self.fuzzy_timeout)
    }
}

fn default_max_results() -> usize {
    10
}

fn default_min_similarity() -> u8 {
    50
}

fn default_fuzzy_timeout() -> u64 {
    10
}

/// Cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_image_max_age_days")]
    pub image_max_age_days: u64,
    #[serde(default = "default_image_max_size_mb")]
    pub image_max_size_mb: u64,
    #[serde(default = "default_api_ttl_seconds")]
    pub api_ttl_seconds: u64,
    #[serde(default = "default_api_max_entries")]
    pub api_max_entries: usize,
    /// Seconds between periodic sweeps of both caches.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            image_max_age_days: default_image_max_age_days(),
            image_max_size_mb: default_image_max_size_mb(),
            api_ttl_seconds: default_api_ttl_seconds(),
            api_max_entries: default_api_max_entries(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    pub fn api_ttl(&self) -> Duration {
        Duration::from_secs(self.api_ttl_seconds)
    }

    pub fn image_max_age(&self) -> Duration {
        Duration::from_secs(self.image_max_age_days.saturating_mul(24 * 3600))
    }

    /// Image cache cap in bytes (1 MB = 1 000 000 bytes).
    pub fn image_max_bytes(&self) -> u64 {
        self.image_max_size_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

fn default_image_max_age_days() -> u64 {
    7
}

fn default_image_max_size_mb() -> u64 {
    100
}

fn default_api_ttl_seconds() -> u64 {
    3600
}

fn default_api_max_entries() -> usize {
    128
}

fn default_sweep_interval() -> u64 {
    3600
}

/// Token-bucket policy for one command: `rate` uses per `per` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRule {
    pub rate: u32,
    pub per: u64,
}

impl CooldownRule {
    pub fn new(rate: u32, per: u64) -> Self {
        Self { rate, per }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.per)
    }
}

impl Config {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// An explicit file that does not exist is an error; pass `None` to
    /// skip the file layer entirely.
    pub fn load<I>(file: Option<&Path>, env: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let file_layer = match file {
            Some(path) => {
                if !path.exists() {
                    return Err(GalcacheError::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                let content = fs::read_to_string(path).map_err(|e| {
                    GalcacheError::Config(format!(
                        "failed to read config file {}: {e}",
                        path.display()
                    ))
                })?;
                Some(parse_file(&content, FileFormat::from_path(path)).map_err(|e| {
                    GalcacheError::Config(format!(
                        "failed to parse config file {}: {e}",
                        path.display()
                    ))
                })?)
            }
            None => None,
        };
        Self::layered(file_layer, env)
    }

    /// Build a config from in-memory file contents plus environment overrides.
    pub fn from_str_with_env<I>(content: &str, format: FileFormat, env: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let file_layer = parse_file(content, format)
            .map_err(|e| GalcacheError::Config(format!("failed to parse config: {e}")))?;
        Self::layered(Some(file_layer), env)
    }

    /// Where the config file lives when no explicit path is given:
    /// `<cache_dir>/config.json`, honouring a `GALCACHE_CACHE_DIR` override.
    pub fn default_path<I>(env: I) -> PathBuf
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let key = format!("{ENV_PREFIX}CACHE_DIR");
        env.into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
            .map(|(_, v)| PathBuf::from(v))
            .unwrap_or_else(default_cache_dir)
            .join(CONFIG_FILE_NAME)
    }

    /// Write a config file containing every default (atomic write via tmp + rename).
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                GalcacheError::Config(format!(
                    "failed to create config dir {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let json = serde_json::to_string_pretty(&Config::default())
            .map_err(|e| GalcacheError::Config(format!("failed to serialize config: {e}")))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| {
            GalcacheError::Config(format!(
                "failed to write config file {}: {e}",
                tmp_path.display()
            ))
        })?;
        fs::rename(&tmp_path, path).map_err(|e| {
            GalcacheError::Config(format!(
                "failed to rename config file {} → {}: {e}",
                tmp_path.display(),
                path.display()
            ))
        })
    }

    /// `<cache_dir>/cache/images`
    pub fn image_dir(&self) -> PathBuf {
        self.cache_dir.join("cache").join("images")
    }

    pub fn token_refresh_period(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval.saturating_mul(60))
    }

    /// Upper bound on one upstream call: every attempt at its full timeout
    /// plus the capped backoff between attempts.
    pub fn request_deadline(&self) -> Duration {
        let attempts = self.max_retries.clamp(1, MAX_ATTEMPTS);
        let retry = crate::api::RetryConfig::from_config(self);
        let backoff = (0..attempts - 1)
            .map(|a| retry.delay_for_attempt(a))
            .fold(Duration::ZERO, Duration::saturating_add);
        self.api
            .request_timeout()
            .saturating_mul(attempts)
            .saturating_add(backoff)
    }

    /// Effective fuzzy floor: the stricter of `similarity` and
    /// `search.min_similarity`.
    pub fn similarity_floor(&self) -> u8 {
        self.similarity.max(self.search.min_similarity)
    }

    fn layered<I>(file_layer: Option<Value>, env: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut merged = serde_json::to_value(Config::default())
            .map_err(|e| GalcacheError::Config(format!("failed to serialize defaults: {e}")))?;
        if let Some(file_layer) = file_layer {
            merge(&mut merged, file_layer);
        }
        apply_env(&mut merged, env);

        let config: Config = serde_json::from_value(merged)
            .map_err(|e| GalcacheError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields and numeric ranges.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl Into<String>) -> Result<()> {
            Err(GalcacheError::Config(msg.into()))
        }
        fn too_long(field: &str, secs: u64) -> Result<()> {
            if secs > MAX_DURATION_SECS {
                return invalid(format!(
                    "{field} must be at most {MAX_DURATION_SECS} seconds, got {secs}"
                ));
            }
            Ok(())
        }

        if self.similarity > 100 {
            return invalid(format!("similarity must be 0-100, got {}", self.similarity));
        }
        if self.cache_dir.as_os_str().is_empty() {
            return invalid("cache_dir must not be empty");
        }
        if self.token_refresh_interval < 1 {
            return invalid("token_refresh_interval must be at least 1 minute");
        }
        too_long("token_refresh_interval", self.token_refresh_interval.saturating_mul(60))?;
        if self.max_retries < 1 {
            return invalid("max_retries must be at least 1");
        }
        if self.max_retries > MAX_ATTEMPTS {
            return invalid(format!(
                "max_retries must be at most {MAX_ATTEMPTS}, got {}",
                self.max_retries
            ));
        }

        if self.api.base_url.is_empty() {
            return invalid("api.base_url must not be empty");
        }
        if let Err(e) = reqwest::Url::parse(&self.api.base_url) {
            return invalid(format!("api.base_url '{}' is not a URL: {e}", self.api.base_url));
        }
        if self.api.timeout < 1 {
            return invalid("api.timeout must be at least 1 second");
        }
        too_long("api.timeout", self.api.timeout)?;
        match self.api.client_id.as_deref() {
            Some(id) if !id.is_empty() => {}
            _ => return invalid("missing required field api.client_id"),
        }
        match self.api.client_secret.as_deref() {
            Some(secret) if !secret.is_empty() => {}
            _ => return invalid("missing required field api.client_secret"),
        }

        if self.image.max_size_bytes < 1 {
            return invalid("image.max_size_bytes must be at least 1");
        }
        if self.image.formats.is_empty() {
            return invalid("image.formats must not be empty");
        }
        if !self
            .image
            .formats
            .iter()
            .any(|f| f.eq_ignore_ascii_case(&self.image.default_format))
        {
            return invalid(format!(
                "image.default_format '{}' is not in image.formats",
                self.image.default_format
            ));
        }

        if self.search.max_results < 1 {
            return invalid("search.max_results must be at least 1");
        }
        if self.search.min_similarity > 100 {
            return invalid(format!(
                "search.min_similarity must be 0-100, got {}",
                self.search.min_similarity
            ));
        }
        if self.search.fuzzy_timeout < 1 {
            return invalid("search.fuzzy_timeout must be at least 1 second");
        }
        too_long("search.fuzzy_timeout", self.search.fuzzy_timeout)?;

        if self.cache.image_max_age_days < 1 {
            return invalid("cache.image_max_age_days must be at least 1");
        }
        too_long(
            "cache.image_max_age_days",
            self.cache.image_max_age_days.saturating_mul(24 * 3600),
        )?;
        if self.cache.image_max_size_mb < 1 {
            return invalid("cache.image_max_size_mb must be at least 1");
        }
        if self.cache.api_ttl_seconds < 1 {
            return invalid("cache.api_ttl_seconds must be at least 1");
        }
        too_long("cache.api_ttl_seconds", self.cache.api_ttl_seconds)?;
        if self.cache.api_max_entries < 1 {
            return invalid("cache.api_max_entries must be at least 1");
        }
        if self.cache.sweep_interval < 1 {
            return invalid("cache.sweep_interval must be at least 1");
        }
        too_long("cache.sweep_interval", self.cache.sweep_interval)?;

        for (command, rule) in &self.cooldown {
            if rule.rate < 1 {
                return invalid(format!("cooldown.{command}.rate must be at least 1"));
            }
            if rule.per < 1 {
                return invalid(format!("cooldown.{command}.per must be at least 1"));
            }
            too_long(&format!("cooldown.{command}.per"), rule.per)?;
        }
        Ok(())
    }
}

fn parse_file(content: &str, format: FileFormat) -> std::result::Result<Value, String> {
    match format {
        FileFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        FileFormat::Toml => {
            let table: toml::Value = toml::from_str(content).map_err(|e| e.to_string())?;
            serde_json::to_value(table).map_err(|e| e.to_string())
        }
    }
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; anything
/// else replaces.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `GALCACHE_*` overrides onto the merged tree.
///
/// Where the tree already holds a string (or null) at the target path the
/// raw value is kept as a string, so secrets like `123456` stay strings.
/// Elsewhere the value is parsed as JSON, falling back to a string.
fn apply_env<I>(tree: &mut Value, env: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, raw) in env {
        let upper = key.to_ascii_uppercase();
        let Some(rest) = upper.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<String> = rest
            .split(ENV_SEPARATOR)
            .map(|segment| segment.to_ascii_lowercase())
            .collect();
        if path.iter().any(|segment| segment.is_empty()) {
            continue;
        }
        set_path(tree, &path, raw);
    }
}

fn set_path(tree: &mut Value, path: &[String], raw: String) {
    let mut node = tree;
    for segment in &path[..path.len() - 1] {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };
    let leaf = &path[path.len() - 1];
    let value = match map.get(leaf) {
        Some(Value::String(_)) | Some(Value::Null) => Value::String(raw),
        _ => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
    };
    map.insert(leaf.clone(), value);
}

//! Tests for loading [`Config`] from disk and the environment.

use std::path::PathBuf;
use std::time::Duration;

use galcache::{Config, GalcacheError};

fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn load_json_file_with_env_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{
            "similarity": 80,
            "api": { "client_id": "from-file", "client_secret": "file-secret", "timeout": 15 },
            "cache": { "api_ttl_seconds": 600 },
            "cooldown": { "search": { "rate": 3, "per": 30 } }
        }"#,
    )
    .unwrap();

    let config = Config::load(
        Some(&path),
        env(&[("GALCACHE_API__CLIENT_ID", "from-env"), ("UNRELATED", "x")]),
    )
    .unwrap();

    assert_eq!(config.similarity, 80);
    assert_eq!(config.api.client_id.as_deref(), Some("from-env"));
    assert_eq!(config.api.client_secret.as_deref(), Some("file-secret"));
    assert_eq!(config.api.request_timeout(), Duration::from_secs(15));
    assert_eq!(config.cache.api_ttl(), Duration::from_secs(600));
    assert_eq!(config.cooldown["search"].rate, 3);
    // Defaults survive for everything the file leaves out.
    assert_eq!(config.cache.api_max_entries, 128);
    assert!(config.cooldown.contains_key("fuzzy"));
}

#[test]
fn load_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("galcache.toml");
    std::fs::write(
        &path,
        r#"
max_retries = 5

[api]
client_id = "id"
client_secret = "secret"

[image]
formats = ["png", "webp"]
default_format = "png"
"#,
    )
    .unwrap();

    let config = Config::load(Some(&path), Vec::new()).unwrap();
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.image.formats, ["png", "webp"]);
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(Some(&dir.path().join("nope.json")), Vec::new()).unwrap_err();
    assert!(matches!(err, GalcacheError::Config(msg) if msg.contains("not found")));
}

#[test]
fn unparsable_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        Config::load(Some(&path), Vec::new()),
        Err(GalcacheError::Config(_))
    ));
}

#[test]
fn written_defaults_load_once_credentials_are_added() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");
    Config::write_default(&path).unwrap();
    assert!(path.exists());
    assert!(!path.with_extension("json.tmp").exists());

    // The template has no credentials, so it needs them from the environment.
    assert!(Config::load(Some(&path), Vec::new()).is_err());
    let config = Config::load(
        Some(&path),
        env(&[
            ("GALCACHE_API__CLIENT_ID", "id"),
            ("GALCACHE_API__CLIENT_SECRET", "secret"),
        ]),
    )
    .unwrap();
    assert_eq!(config.similarity, 70);
}

#[test]
fn default_path_follows_cache_dir_override() {
    let path = Config::default_path(env(&[("GALCACHE_CACHE_DIR", "/srv/galcache")]));
    assert_eq!(path, PathBuf::from("/srv/galcache/config.json"));
}

#[test]
fn request_deadline_covers_every_attempt() {
    let mut config = Config::default();
    config.api.timeout = 10;
    config.max_retries = 3;
    // Three 10s attempts plus 0.5s + 1s of backoff.
    assert_eq!(config.request_deadline(), Duration::from_millis(31_500));
}

// ============================================================================
// Upper bounds
// ============================================================================

const U64_MAX: &str = "18446744073709551615";

fn load_with(overrides: &[(&str, &str)]) -> galcache::Result<Config> {
    let mut vars = env(&[
        ("GALCACHE_API__CLIENT_ID", "id"),
        ("GALCACHE_API__CLIENT_SECRET", "secret"),
    ]);
    vars.extend(env(overrides));
    Config::load(None, vars)
}

fn assert_rejected(key: &str, value: &str, field: &str) {
    match load_with(&[(key, value)]) {
        Err(GalcacheError::Config(msg)) => assert!(msg.contains(field), "{key}: {msg}"),
        other => panic!("{key}={value} should be rejected, got {other:?}"),
    }
}

#[test]
fn oversized_durations_are_rejected() {
    assert_rejected("GALCACHE_API__TIMEOUT", U64_MAX, "api.timeout");
    assert_rejected("GALCACHE_CACHE__API_TTL_SECONDS", U64_MAX, "cache.api_ttl_seconds");
    assert_rejected("GALCACHE_CACHE__IMAGE_MAX_AGE_DAYS", U64_MAX, "cache.image_max_age_days");
    assert_rejected("GALCACHE_CACHE__SWEEP_INTERVAL", U64_MAX, "cache.sweep_interval");
    assert_rejected("GALCACHE_SEARCH__FUZZY_TIMEOUT", U64_MAX, "search.fuzzy_timeout");
    assert_rejected("GALCACHE_TOKEN_REFRESH_INTERVAL", U64_MAX, "token_refresh_interval");
    assert_rejected("GALCACHE_MAX_RETRIES", "4294967295", "max_retries");
    // One past a year is already too long.
    assert_rejected("GALCACHE_API__TIMEOUT", "31536001", "api.timeout");
}

#[test]
fn oversized_cooldown_window_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        format!(r#"{{ "cooldown": {{ "search": {{ "rate": 1, "per": {U64_MAX} }} }} }}"#),
    )
    .unwrap();
    let err = Config::load(
        Some(&path),
        env(&[
            ("GALCACHE_API__CLIENT_ID", "id"),
            ("GALCACHE_API__CLIENT_SECRET", "secret"),
        ]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("cooldown.search.per"), "{err}");
}

#[test]
fn longest_accepted_durations_stay_usable() {
    let year = galcache::config::MAX_DURATION_SECS.to_string();
    let config = load_with(&[
        ("GALCACHE_API__TIMEOUT", year.as_str()),
        ("GALCACHE_CACHE__API_TTL_SECONDS", year.as_str()),
        ("GALCACHE_SEARCH__FUZZY_TIMEOUT", year.as_str()),
        ("GALCACHE_MAX_RETRIES", "10"),
    ])
    .unwrap();
    let year = Duration::from_secs(galcache::config::MAX_DURATION_SECS);
    assert!(config.request_deadline() >= year * 10);
    assert_eq!(config.cache.api_ttl(), year);
}

#[test]
fn derived_durations_saturate_when_unvalidated() {
    let mut config = Config::default();
    config.api.timeout = u64::MAX;
    config.max_retries = u32::MAX;
    config.token_refresh_interval = u64::MAX;
    config.cache.image_max_age_days = u64::MAX;

    assert_eq!(config.request_deadline(), Duration::MAX);
    assert_eq!(config.token_refresh_period(), Duration::from_secs(u64::MAX));
    assert_eq!(config.cache.image_max_age(), Duration::from_secs(u64::MAX));
}

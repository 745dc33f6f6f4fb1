//! End-to-end tests for [`Gateway`] against a wiremock archive API.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use galcache::{Config, CooldownRule, GalcacheError, Gateway, ImageFormat, RetryConfig};

/// Token endpoint handing out `tok-1`, `tok-2`, ...
struct IssueSequence(AtomicU32);

impl Respond for IssueSequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        ResponseTemplate::new(200).set_body_json(json!({
            "access_token": format!("tok-{n}"),
            "expires_in": 3600
        }))
    }
}

async fn mount_token_endpoint(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(IssueSequence(AtomicU32::new(0)))
        .mount(server)
        .await;
}

fn base_config(server: &MockServer, dir: &Path) -> Config {
    let mut config = Config::default();
    config.api.base_url = server.uri();
    config.api.timeout = 5;
    config.api.client_id = Some("client".into());
    config.api.client_secret = Some("secret".into());
    config.cache_dir = dir.to_path_buf();
    config.cooldown.clear();
    config
}

async fn gateway(server: &MockServer, dir: &Path, tweak: impl FnOnce(&mut Config)) -> Gateway {
    mount_token_endpoint(server).await;
    let mut config = base_config(server, dir);
    tweak(&mut config);
    Gateway::builder(Arc::new(config))
        .retry(RetryConfig::new().initial_delay(Duration::from_millis(5)))
        .build()
        .await
        .unwrap()
}

fn ok(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "success": true, "code": 0, "data": data }))
}

fn not_found() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "success": false,
        "code": 614,
        "msg": "游戏不存在"
    }))
}

fn jpeg(len: usize) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.resize(len, 0);
    bytes
}

async fn mount_archive(server: &MockServer, gid: u64, game: Value) {
    Mock::given(method("GET"))
        .and(path("/open/archive"))
        .and(query_param("gid", gid.to_string()))
        .respond_with(ok(json!({ "game": game })))
        .expect(1)
        .mount(server)
        .await;
}

// =============================================================================
// Builder
// =============================================================================

#[tokio::test]
async fn build_requires_credentials() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&server, dir.path());
    config.api.client_secret = None;

    let result = Gateway::builder(Arc::new(config)).build().await;
    assert!(matches!(result, Err(GalcacheError::Config(_))));
}

#[tokio::test]
async fn build_creates_image_directory() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = gateway(&server, dir.path(), |_| {}).await;

    assert!(dir.path().join("cache").join("images").is_dir());
    assert_eq!(gateway.images().stats().entries, 0);
}

// =============================================================================
// search
// =============================================================================

#[tokio::test]
async fn search_returns_scored_game_and_caches_it() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("GET"))
        .and(path("/open/archive/search-game"))
        .and(query_param("mode", "accurate"))
        .and(query_param("keyword", "CLANNAD"))
        .and(query_param("similarity", "70"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ok(json!({
            "game": { "gid": 42, "name": "CLANNAD", "releaseDate": "2004-04-28" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let hit = gateway.search("alice", "CLANNAD").await.unwrap();
    assert_eq!(hit.title, "CLANNAD");
    assert_eq!(hit.score, 100);
    assert_eq!(hit.record.game_id(), Some(42));
    assert_eq!(hit.record.release_date.as_deref(), Some("2004-04-28"));

    // Served from the response cache.
    let again = gateway.search("bob", "CLANNAD").await.unwrap();
    assert_eq!(again, hit);
    assert_eq!(gateway.responses().stats().hits, 1);
}

#[tokio::test]
async fn search_miss_is_not_found_and_not_cached() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("GET"))
        .and(path("/open/archive/search-game"))
        .respond_with(not_found())
        .expect(2)
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    for _ in 0..2 {
        let err = gateway.search("alice", "no such game").await.unwrap_err();
        assert!(matches!(err, GalcacheError::NotFound(_)));
    }
    assert!(gateway.responses().is_empty());
}

#[tokio::test]
async fn envelope_failure_code_is_a_server_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("GET"))
        .and(path("/open/archive/search-game"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "code": 500,
            "msg": "internal"
        })))
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let err = gateway.search("alice", "CLANNAD").await.unwrap_err();
    assert!(matches!(err, GalcacheError::Server { status: 502, .. }));
}

#[tokio::test]
async fn cooldown_rejects_before_upstream() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("GET"))
        .and(path("/open/archive/search-game"))
        .respond_with(ok(json!({ "game": { "gid": 1, "name": "Rewrite" } })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |config| {
        config
            .cooldown
            .insert("search".into(), CooldownRule::new(1, 60));
    })
    .await;

    gateway.search("alice", "Rewrite").await.unwrap();
    let err = gateway.search("alice", "Rewrite").await.unwrap_err();
    match err {
        GalcacheError::RateLimited { command, retry_after } => {
            assert_eq!(command, "search");
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    // A different user has their own bucket, and the answer is cached.
    gateway.search("bob", "Rewrite").await.unwrap();
}

// =============================================================================
// fuzzy_lookup
// =============================================================================

#[tokio::test]
async fn fuzzy_lookup_ranks_and_deduplicates() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("GET"))
        .and(path("/open/archive/search-game"))
        .and(query_param("mode", "list"))
        .and(query_param("keyword", "fate"))
        .and(query_param("pageNum", "1"))
        .and(query_param("pageSize", "20"))
        .respond_with(ok(json!({
            "result": [
                { "id": 1, "name": "Fate/Zero", "chineseName": "Fate/Zero" },
                { "id": 2, "name": "CLANNAD", "chineseName": "团子大家族" },
                { "id": 3, "name": "Fate/stay night", "chineseName": "命运之夜" },
                { "name": 7 }
            ],
            "total": 4
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |config| {
        config.similarity = 40;
        config.search.min_similarity = 40;
    })
    .await;
    let ranked = gateway.fuzzy_lookup("alice", "fate").await.unwrap();

    let ids: Vec<_> = ranked.iter().map(|hit| hit.record.game_id()).collect();
    assert_eq!(ids, [Some(1), Some(3)]);
    assert!(ranked.iter().all(|hit| hit.score >= 40));
}

#[tokio::test]
async fn fuzzy_lookup_fills_max_results_with_distinct_games() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("GET"))
        .and(path("/open/archive/search-game"))
        .and(query_param("mode", "list"))
        .respond_with(ok(json!({
            "result": [
                { "id": 1, "name": "fate", "chineseName": "Fate" },
                { "id": 2, "name": "Fate/Zero" },
                { "id": 3, "name": "Fate/stay night" }
            ]
        })))
        .mount(&server)
        .await;

    // Game 1 owns the two best-scoring titles; it must not crowd out game 2.
    let gateway = gateway(&server, dir.path(), |config| {
        config.similarity = 40;
        config.search.min_similarity = 40;
        config.search.max_results = 2;
    })
    .await;
    let ranked = gateway.fuzzy_lookup("alice", "fate").await.unwrap();

    let ids: Vec<_> = ranked.iter().map(|hit| hit.record.game_id()).collect();
    assert_eq!(ids, [Some(1), Some(2)]);
    assert_eq!(ranked[0].score, 100);
}

#[tokio::test]
async fn fuzzy_lookup_without_match_is_not_found() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("GET"))
        .and(path("/open/archive/search-game"))
        .respond_with(ok(json!({ "result": [{ "id": 2, "name": "CLANNAD" }] })))
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let err = gateway.fuzzy_lookup("alice", "fate").await.unwrap_err();
    assert!(matches!(err, GalcacheError::NotFound(_)));
}

// =============================================================================
// info
// =============================================================================

#[tokio::test]
async fn concurrent_info_requests_share_one_upstream_call() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("GET"))
        .and(path("/open/archive"))
        .and(query_param("gid", "7"))
        .respond_with(
            ok(json!({ "game": { "gid": 7, "name": "Little Busters!" } }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let results = join_all((0..5).map(|i| {
        let user = format!("user-{i}");
        let gateway = &gateway;
        async move { gateway.info(&user, 7).await }
    }))
    .await;

    for result in results {
        assert_eq!(result.unwrap()["game"]["name"], "Little Busters!");
    }
}

#[tokio::test]
async fn rejected_token_is_refreshed_transparently() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("GET"))
        .and(path("/open/archive"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/open/archive"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ok(json!({ "game": { "gid": 9, "name": "Rewrite" } })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let data = gateway.info("alice", 9).await.unwrap();
    assert_eq!(data["game"]["gid"], 9);
    assert_eq!(gateway.tokens().current_token().await.unwrap().value, "tok-2");
}

// =============================================================================
// developer
// =============================================================================

async fn mount_org(server: &MockServer, org_id: u64, org: Value) {
    Mock::given(method("GET"))
        .and(path("/open/archive"))
        .and(query_param("orgId", org_id.to_string()))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ok(json!({ "org": org })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn developer_is_read_and_cached() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_org(
        &server,
        12,
        json!({
            "orgId": 12,
            "name": "Key",
            "chineseName": "",
            "introduction": "Visual Arts brand",
            "country": "JP"
        }),
    )
    .await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let org = gateway.developer("alice", 12).await.unwrap();
    assert_eq!(org.name, "Key");
    assert_eq!(org.title(), "Key");
    assert_eq!(org.country.as_deref(), Some("JP"));

    // Second call is a cache hit (the mock expects one request).
    assert_eq!(gateway.developer("bob", 12).await.unwrap(), org);
    assert_eq!(gateway.responses().stats().hits, 1);
}

#[tokio::test]
async fn developer_of_follows_the_game_record() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_archive(&server, 7, json!({ "gid": 7, "name": "CLANNAD", "developerId": 12 })).await;
    mount_org(&server, 12, json!({ "orgId": 12, "name": "Key", "chineseName": "Key社" })).await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let org = gateway.developer_of("alice", 7).await.unwrap();
    assert_eq!(org.org_id, Some(12));
    assert_eq!(org.title(), "Key社");
}

#[tokio::test]
async fn game_without_developer_is_not_found() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_archive(&server, 8, json!({ "gid": 8, "name": "Doujin" })).await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let err = gateway.developer_of("alice", 8).await.unwrap_err();
    assert!(matches!(err, GalcacheError::NotFound(msg) if msg.contains("developer")));
}

#[tokio::test]
async fn unknown_developer_is_not_found() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("GET"))
        .and(path("/open/archive"))
        .and(query_param("orgId", "404"))
        .respond_with(not_found())
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let err = gateway.developer("alice", 404).await.unwrap_err();
    assert!(matches!(err, GalcacheError::NotFound(_)));
}

#[tokio::test]
async fn developer_has_its_own_cooldown() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_org(&server, 12, json!({ "orgId": 12, "name": "Key" })).await;

    let gateway = gateway(&server, dir.path(), |config| {
        config
            .cooldown
            .insert("developer".to_string(), CooldownRule::new(1, 60));
    })
    .await;
    gateway.developer("alice", 12).await.unwrap();
    let err = gateway.developer_of("alice", 7).await.unwrap_err();
    assert!(matches!(err, GalcacheError::RateLimited { command, .. } if command == "developer"));
}

// =============================================================================
// fetch_image
// =============================================================================

#[tokio::test]
async fn cover_image_is_downloaded_once_and_cached_on_disk() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let cover_url = format!("{}/img/cover.jpg", server.uri());
    mount_archive(&server, 5, json!({ "gid": 5, "name": "AIR", "mainImg": cover_url })).await;
    Mock::given(method("GET"))
        .and(path("/img/cover.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg(256)))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let first = gateway.fetch_image("alice", 5).await.unwrap();
    assert_eq!(first.game_id, 5);
    assert_eq!(first.format, ImageFormat::Jpg);
    assert_eq!(first.bytes, jpeg(256));

    let second = gateway.fetch_image("alice", 5).await.unwrap();
    assert_eq!(second, first);

    let stored = dir
        .path()
        .join("cache")
        .join("images")
        .join(format!("{}.jpg", first.key));
    assert_eq!(std::fs::read(stored).unwrap(), jpeg(256));
}

#[tokio::test]
async fn oversized_cover_is_rejected() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let cover_url = format!("{}/img/huge.jpg", server.uri());
    mount_archive(&server, 6, json!({ "gid": 6, "name": "Kanon", "mainImg": cover_url })).await;
    Mock::given(method("GET"))
        .and(path("/img/huge.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg(4096)))
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |config| {
        config.image.max_size_bytes = 1024;
    })
    .await;
    let err = gateway.fetch_image("alice", 6).await.unwrap_err();
    assert!(matches!(err, GalcacheError::TooLarge { limit: 1024, .. }));
    assert_eq!(gateway.images().stats().entries, 0);
}

#[tokio::test]
async fn unaccepted_format_is_rejected_and_not_cached() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let cover_url = format!("{}/img/anim.gif", server.uri());
    mount_archive(&server, 8, json!({ "gid": 8, "name": "planetarian", "mainImg": cover_url })).await;
    Mock::given(method("GET"))
        .and(path("/img/anim.gif"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"GIF89a\x01\x00\x01\x00".to_vec()))
        .mount(&server)
        .await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let err = gateway.fetch_image("alice", 8).await.unwrap_err();
    assert!(matches!(err, GalcacheError::Malformed(_)));
    assert_eq!(gateway.images().stats().entries, 0);
}

#[tokio::test]
async fn game_without_cover_is_not_found() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_archive(&server, 3, json!({ "gid": 3, "name": "ONE", "mainImg": "" })).await;

    let gateway = gateway(&server, dir.path(), |_| {}).await;
    let err = gateway.fetch_image("alice", 3).await.unwrap_err();
    assert!(matches!(err, GalcacheError::NotFound(_)));
}

// =============================================================================
// Maintenance
// =============================================================================

#[tokio::test]
async fn background_tasks_start_and_stop() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = gateway(&server, dir.path(), |_| {}).await;

    let tasks = gateway.start_background();
    let names: Vec<_> = tasks.iter().map(|task| task.name()).collect();
    assert_eq!(names, ["token-refresh", "response-cache-sweep", "image-cache-sweep"]);
    assert!(tasks.iter().all(|task| !task.is_finished()));
    drop(tasks);
}

#[tokio::test]
async fn manual_sweep_on_fresh_caches_removes_nothing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = gateway(&server, dir.path(), |_| {}).await;

    let report = gateway.sweep().await;
    assert_eq!((report.responses, report.images), (0, 0));
}

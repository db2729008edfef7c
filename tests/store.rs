#[path = "common/mod.rs"]
mod common;

use std::collections::BTreeMap;

use axum::http::{header, HeaderMap, HeaderValue};
use common::{at, captured, sqlite_url};
use tarpit::request::{IncomingRequest, Method, RawRequest};
use tarpit::scoring::ThreatClassifier;
use tarpit::store::{MatchMode, SearchQuery, Store, StoreError};

async fn open_store(dir: &tempfile::TempDir) -> Store {
    Store::connect(&sqlite_url(dir.path()), 2).await.unwrap()
}

/// Three requests from two actors, one second apart.
async fn seed(store: &Store) {
    let mut scan = captured("198.51.100.1", Method::Get, "/wp-login.php", 1);
    scan.headers.insert("user-agent".into(), "sqlmap/1.7.2".into());
    store.record_request(&scan, 10).await.unwrap();

    let mut login = captured("198.51.100.2", Method::Post, "/api/login", 2);
    login.query_string = Some("user=admin".into());
    login.body = Some(serde_json::json!({"password": "hunter2"}));
    store.record_request(&login, 8).await.unwrap();

    let admin = captured("198.51.100.1", Method::Get, "/Admin", 3);
    store.record_request(&admin, 6).await.unwrap();
}

fn paths(requests: &[tarpit::store::StoredRequest]) -> Vec<&str> {
    requests.iter().map(|r| r.request.path.as_str()).collect()
}

#[tokio::test]
async fn ensure_actor_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let first = store.ensure_actor("192.0.2.1").await.unwrap();
    let second = store.ensure_actor("192.0.2.1").await.unwrap();
    assert_eq!(first, second);

    let actors = store.list_actors_with_stats().await.unwrap();
    assert_eq!(actors.len(), 1);
    assert_eq!(actors[0].total, 0);
}

#[tokio::test]
async fn recorded_request_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let mut req = captured("192.0.2.5", Method::Patch, "/api/users/7", 42);
    req.query_string = Some("force=1&debug=true".into());
    req.headers.insert("x-forwarded-for".into(), "10.0.0.1, 10.0.0.2".into());
    req.body = Some(serde_json::json!({"role": "admin", "tags": ["a", "b"]}));
    let recorded = store.record_request(&req, 7).await.unwrap();

    let listed = store.list_requests(Some("192.0.2.5"), None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, recorded.request_id);
    assert_eq!(listed[0].request, req);
    assert_eq!(listed[0].threat_level, 7);
    assert!(!listed[0].acceptable);

    let fetched = store.get_request(recorded.request_id).await.unwrap().unwrap();
    assert_eq!(fetched, listed[0]);
    assert_eq!(recorded.actor_threat_level, Some(7));
    assert!(store.get_request(recorded.request_id + 100).await.unwrap().is_none());
}

#[tokio::test]
async fn stored_actor_level_tracks_every_insert() {
    let dir = tempfile::tempdir().unwrap();
    // Pools larger than one spread statements across connections.
    for pool_size in [1, 2, 5] {
        let store = Store::connect(&sqlite_url(dir.path()), pool_size).await.unwrap();
        let address = format!("192.0.2.{pool_size}");
        let mut expected_sum = 0u32;
        for (i, level) in [1u8, 10, 4, 9, 2, 10].into_iter().enumerate() {
            let req = captured(&address, Method::Get, "/x", i as i64);
            let recorded = store.record_request(&req, level).await.unwrap();
            expected_sum += u32::from(level);
            let expected = (expected_sum / (i as u32 + 1)) as u8;
            assert_eq!(recorded.actor_threat_level, Some(expected));
            let stored = store.get_actor(&address).await.unwrap().unwrap();
            assert_eq!(stored.threat_level, expected, "pool {pool_size}, insert {i}");
            assert_eq!(store.actor_threat_level(recorded.actor_id).await.unwrap(), expected);
        }
        store.close().await;
    }
}

#[tokio::test]
async fn failed_actor_refresh_keeps_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    sqlx::query(
        "CREATE TRIGGER freeze_actor_level BEFORE UPDATE OF threat_level ON actors \
         BEGIN SELECT RAISE(ABORT, 'frozen'); END",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let recorded = store
        .record_request(&captured("192.0.2.40", Method::Get, "/.env", 1), 10)
        .await
        .unwrap();
    assert_eq!(recorded.actor_threat_level, None);
    assert!(store.get_request(recorded.request_id).await.unwrap().is_some());
    assert_eq!(store.get_actor("192.0.2.40").await.unwrap().unwrap().threat_level, 0);
    assert!(store.refresh_actor_threat_level(recorded.actor_id).await.is_err());
}

#[tokio::test]
async fn empty_search_returns_everything_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    seed(&store).await;

    let all = store.search(&SearchQuery::default()).await.unwrap();
    assert_eq!(paths(&all), vec!["/Admin", "/api/login", "/wp-login.php"]);
    assert_eq!(all, store.list_requests(None, None).await.unwrap());
}

#[tokio::test]
async fn search_combines_filters_by_match_mode() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    seed(&store).await;

    let mut query = SearchQuery {
        uri: Some("login".into()),
        method: Some("GET".into()),
        ..Default::default()
    };
    let any = store.search(&query).await.unwrap();
    assert_eq!(any.len(), 3);

    query.match_mode = MatchMode::All;
    let all = store.search(&query).await.unwrap();
    assert_eq!(paths(&all), vec!["/wp-login.php"]);

    let by_header = SearchQuery {
        headers: Some("SQLMAP".into()),
        ..Default::default()
    };
    assert_eq!(paths(&store.search(&by_header).await.unwrap()), vec!["/wp-login.php"]);

    let by_body = SearchQuery {
        body: Some("hunter2".into()),
        threat_level: Some(8),
        match_mode: MatchMode::All,
        ..Default::default()
    };
    assert_eq!(paths(&store.search(&by_body).await.unwrap()), vec!["/api/login"]);
}

#[tokio::test]
async fn search_respects_case_sensitivity() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    seed(&store).await;

    let mut query = SearchQuery {
        uri: Some("admin".into()),
        ..Default::default()
    };
    assert_eq!(paths(&store.search(&query).await.unwrap()), vec!["/Admin"]);

    query.case_sensitive = true;
    assert!(store.search(&query).await.unwrap().is_empty());

    query.uri = Some("Admin".into());
    assert_eq!(paths(&store.search(&query).await.unwrap()), vec!["/Admin"]);
}

#[tokio::test]
async fn search_values_are_never_interpreted() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    seed(&store).await;

    let hostile = SearchQuery {
        uri: Some("'; DROP TABLE requests; --".into()),
        ..Default::default()
    };
    assert!(store.search(&hostile).await.unwrap().is_empty());

    let wildcard = SearchQuery {
        uri: Some("%".into()),
        ..Default::default()
    };
    assert!(store.search(&wildcard).await.unwrap().is_empty());

    assert_eq!(store.list_requests(None, None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn search_rejects_out_of_range_threat_level() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let query = SearchQuery {
        threat_level: Some(42),
        ..Default::default()
    };
    assert!(matches!(
        store.search(&query).await,
        Err(StoreError::InvalidFilter(_))
    ));
}

#[tokio::test]
async fn list_requests_filters_by_actor_and_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    seed(&store).await;

    let by_actor = store.list_requests(Some("198.51.100.1"), None).await.unwrap();
    assert_eq!(paths(&by_actor), vec!["/Admin", "/wp-login.php"]);

    let both = store
        .list_requests(Some("198.51.100.1"), Some("/Admin"))
        .await
        .unwrap();
    assert_eq!(both.len(), 1);

    let none = store
        .list_requests(Some("198.51.100.2"), Some("/Admin"))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn actor_stats_count_valid_and_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let root = captured("192.0.2.10", Method::Get, "/", 1);
    store.record_request(&root, 1).await.unwrap();
    let env = captured("192.0.2.10", Method::Get, "/.env", 2);
    store.record_request(&env, 10).await.unwrap();
    let other = captured("192.0.2.20", Method::Get, "/index.php", 3);
    store.record_request(&other, 6).await.unwrap();
    store.ensure_actor("192.0.2.30").await.unwrap();

    let actors = store.list_actors_with_stats().await.unwrap();
    assert_eq!(actors.len(), 3);
    assert_eq!(actors[0].address, "192.0.2.10");
    assert_eq!((actors[0].valid, actors[0].invalid, actors[0].total), (1, 1, 2));
    assert_eq!(actors[0].threat_level, 5);
    assert_eq!(actors[2].address, "192.0.2.30");
    assert_eq!(actors[2].total, 0);

    let actor = store.get_actor("192.0.2.10").await.unwrap().unwrap();
    assert_eq!(actor.threat_level, 5);
    assert!(store.set_actor_flagged("192.0.2.10", true).await.unwrap());
    assert!(store.get_actor("192.0.2.10").await.unwrap().unwrap().flagged);
    assert!(!store.set_actor_flagged("203.0.113.200", true).await.unwrap());
}

#[tokio::test]
async fn endpoint_reports() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    for (addr, secs) in [("192.0.2.1", 1), ("192.0.2.1", 2), ("192.0.2.2", 3)] {
        store
            .record_request(&captured(addr, Method::Get, "/.git/config", secs), 10)
            .await
            .unwrap();
    }
    store
        .record_request(&captured("192.0.2.2", Method::Get, "/favicon.ico", 4), 6)
        .await
        .unwrap();

    let endpoints = store.list_endpoints().await.unwrap();
    assert_eq!(endpoints[0].path, "/.git/config");
    assert_eq!(endpoints[0].count, 3);
    assert_eq!(endpoints[1].count, 1);

    let hosts = store.hosts_by_endpoint("/.git/config").await.unwrap();
    assert_eq!(hosts.len(), 2);
    assert_eq!((hosts[0].address.as_str(), hosts[0].count), ("192.0.2.1", 2));
    assert_eq!(hosts[0].threat_level, 10);
}

#[tokio::test]
async fn stats_summarise_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let empty = store.stats().await.unwrap();
    assert_eq!(empty.total_requests, 0);
    assert!(empty.last_request.is_none());
    assert!(empty.mean_inter_arrival_secs.is_none());
    assert!(empty.since_last_secs.is_none());

    store.record_request(&captured("192.0.2.1", Method::Get, "/a", 0), 6).await.unwrap();
    store.record_request(&captured("192.0.2.2", Method::Get, "/a", 2), 6).await.unwrap();
    store.record_request(&captured("192.0.2.2", Method::Post, "/b", 4), 9).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.total_actors, 2);
    assert_eq!(stats.distinct_endpoints, 2);
    assert_eq!(stats.mean_inter_arrival_secs, Some(2.0));
    assert!(stats.since_last_secs.unwrap() > 0.0);
    let last = stats.last_request.unwrap();
    assert_eq!(last.request.path, "/b");
    let unique = stats.unique_endpoint.unwrap();
    assert_eq!((unique.method.as_str(), unique.path.as_str(), unique.threat_level), ("POST", "/b", 9));
    let last_actor = stats.last_actor.unwrap();
    assert_eq!(last_actor.address, "192.0.2.2");
    assert_eq!(last_actor.last_seen, Some(at(4)));
}

#[tokio::test]
async fn json_null_body_round_trips_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let mut req = IncomingRequest::from_raw(RawRequest {
        method: "POST",
        remote_addr: "192.0.2.9",
        path: "/api/login",
        query: None,
        headers: &headers,
        body: b"null",
        local_port: 8080,
    });
    assert!(req.body.is_none());
    req.timestamp = at(7);

    let recorded = store.record_request(&req, 3).await.unwrap();
    let fetched = store.get_request(recorded.request_id).await.unwrap().unwrap();
    assert_eq!(fetched.request, req);
}

#[tokio::test]
async fn last_actor_is_the_newest_actor_not_the_newest_request() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    store.record_request(&captured("192.0.2.1", Method::Get, "/a", 1), 6).await.unwrap();
    store.record_request(&captured("192.0.2.2", Method::Get, "/b", 2), 6).await.unwrap();
    store.record_request(&captured("192.0.2.1", Method::Get, "/c", 3), 6).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.last_request.unwrap().request.address, "192.0.2.1");
    let last_actor = stats.last_actor.unwrap();
    assert_eq!(last_actor.address, "192.0.2.2");
    assert_eq!(last_actor.last_seen, Some(at(2)));

    store.ensure_actor("192.0.2.3").await.unwrap();
    let last_actor = store.stats().await.unwrap().last_actor.unwrap();
    assert_eq!(last_actor.address, "192.0.2.3");
    assert!(last_actor.last_seen.is_none());
}

#[tokio::test]
async fn rescore_backfills_changed_levels() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let env = captured("192.0.2.1", Method::Get, "/.env", 1);
    let recorded = store.record_request(&env, 0).await.unwrap();
    let root = captured("192.0.2.1", Method::Get, "/", 2);
    store.record_request(&root, 1).await.unwrap();
    assert_eq!(store.get_actor("192.0.2.1").await.unwrap().unwrap().threat_level, 0);

    let changed = store.rescore_all(&ThreatClassifier::default()).await.unwrap();
    assert_eq!(changed, 1);
    let fixed = store.get_request(recorded.request_id).await.unwrap().unwrap();
    assert_eq!(fixed.threat_level, 10);
    assert_eq!(store.get_actor("192.0.2.1").await.unwrap().unwrap().threat_level, 5);

    assert_eq!(store.rescore_all(&ThreatClassifier::default()).await.unwrap(), 0);
}

#[tokio::test]
async fn honeypot_catalog_never_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    assert!(store.insert_honeypot(".env", "APP_KEY=first").await.unwrap());
    assert!(!store.insert_honeypot(".env", "APP_KEY=second").await.unwrap());
    assert_eq!(
        store.lookup_honeypot(".env").await.unwrap().as_deref(),
        Some("APP_KEY=first")
    );
    assert!(store.lookup_honeypot("missing.txt").await.unwrap().is_none());

    let catalog = BTreeMap::from([
        (".env".to_string(), "ignored".to_string()),
        ("id_rsa".to_string(), "-----BEGIN KEY-----".to_string()),
    ]);
    assert_eq!(store.seed_honeypots(&catalog).await.unwrap(), 1);
}

//! Fetch coordinator tests: single-flight, stale-while-revalidate, and
//! degraded serving.
//!
//! Timing-sensitive assertions use generous margins: the TTLs under test are
//! tens of milliseconds while the asserted windows are hundreds.

use std::sync::Arc;
use std::time::{Duration, Instant};
use vitrine_core::cache::{CacheStore, FilterParams};
use vitrine_core::catalog::{CacheSource, CacheStatus, FetchCoordinator, NormalizerSettings};
use vitrine_core::config::{CatalogConfig, UpstreamConfig};
use vitrine_core::upstream::UpstreamClient;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn coordinator_for(
    server: &MockServer,
    catalog: CatalogConfig,
) -> (FetchCoordinator, Arc<CacheStore>) {
    let store = Arc::new(CacheStore::in_memory());
    let upstream = Arc::new(
        UpstreamClient::new(UpstreamConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
            max_attempts: 1,
            retry_base: Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap(),
    );
    let coordinator = FetchCoordinator::new(
        Arc::clone(&store),
        upstream,
        NormalizerSettings::default(),
        catalog,
    );
    (coordinator, store)
}

fn products_body(ids: &[u64]) -> serde_json::Value {
    serde_json::Value::Array(
        ids.iter()
            .map(|id| {
                serde_json::json!({
                    "id": id,
                    "name": format!("Product {}", id),
                    "price": "10.00",
                    "images": [format!("https://cdn.example/{}.png", id)]
                })
            })
            .collect(),
    )
}

#[tokio::test]
async fn concurrent_requests_trigger_exactly_one_upstream_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(products_body(&[1, 2]))
                // Long enough that all callers overlap the fetch.
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (coordinator, _) = coordinator_for(&server, CatalogConfig::default());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.get_products(&FilterParams::default()).await
        }));
    }

    for handle in handles {
        let page = handle.await.unwrap().unwrap();
        assert_eq!(page.products.len(), 2);
        assert_eq!(page.products[0].id, "1");
        assert!(!page.is_stale);
    }
    // expect(1) on the mock asserts the single upstream call on drop.
}

#[tokio::test]
async fn fresh_entries_are_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(products_body(&[1])))
        .expect(1)
        .mount(&server)
        .await;

    let (coordinator, _) = coordinator_for(&server, CatalogConfig::default());

    let first = coordinator.get_products(&FilterParams::default()).await.unwrap();
    assert_eq!(first.status, CacheStatus::Miss);
    assert_eq!(first.source, CacheSource::Upstream);

    let second = coordinator.get_products(&FilterParams::default()).await.unwrap();
    assert_eq!(second.status, CacheStatus::Hit);
    assert_eq!(second.products.len(), 1);
}

#[tokio::test]
async fn stale_entries_serve_immediately_and_refresh_in_background() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(products_body(&[1])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(products_body(&[1, 2]))
                .set_delay(Duration::from_millis(150)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let catalog = CatalogConfig {
        fresh_ttl: Duration::from_millis(80),
        swr_window: Duration::from_secs(30),
        ..Default::default()
    };
    let (coordinator, _) = coordinator_for(&server, catalog);

    let first = coordinator.get_products(&FilterParams::default()).await.unwrap();
    assert_eq!(first.products.len(), 1);

    tokio::time::sleep(Duration::from_millis(120)).await;

    // Stale: the old payload comes back without waiting on the slow refresh.
    let started = Instant::now();
    let second = coordinator.get_products(&FilterParams::default()).await.unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "stale serve must not block on the refresh, took {:?}",
        started.elapsed()
    );
    assert_eq!(second.status, CacheStatus::Stale);
    assert!(second.is_stale);
    assert_eq!(second.products.len(), 1);

    // Once the background refresh lands, the new payload is served fresh.
    coordinator.quiesce(Duration::from_secs(2)).await;
    let third = coordinator.get_products(&FilterParams::default()).await.unwrap();
    assert_eq!(third.products.len(), 2);
    assert!(!third.is_stale);
}

#[tokio::test]
async fn upstream_failure_degrades_to_last_known_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(products_body(&[7])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let catalog = CatalogConfig {
        fresh_ttl: Duration::from_millis(40),
        swr_window: Duration::from_millis(40),
        ..Default::default()
    };
    let (coordinator, _) = coordinator_for(&server, catalog);

    let first = coordinator.get_products(&FilterParams::default()).await.unwrap();
    assert_eq!(first.products.len(), 1);

    // Let both the fresh TTL and the stale window lapse.
    tokio::time::sleep(Duration::from_millis(120)).await;

    let degraded = coordinator.get_products(&FilterParams::default()).await.unwrap();
    assert_eq!(degraded.status, CacheStatus::Stale);
    assert_eq!(degraded.source, CacheSource::Fallback);
    assert!(degraded.is_stale);
    assert_eq!(degraded.products.len(), 1);
    assert_eq!(degraded.products[0].id, "7");
}

#[tokio::test]
async fn upstream_failure_with_no_payload_surfaces_the_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let (coordinator, _) = coordinator_for(&server, CatalogConfig::default());
    let err = coordinator
        .get_products(&FilterParams::default())
        .await
        .unwrap_err();
    assert_eq!(
        err.code(),
        vitrine_core::error::ErrorCode::UpstreamUnavailable
    );
}

#[tokio::test]
async fn namespace_bump_forces_a_refetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(products_body(&[1])))
        .expect(2)
        .mount(&server)
        .await;

    let (coordinator, store) = coordinator_for(&server, CatalogConfig::default());

    let first = coordinator.get_products(&FilterParams::default()).await.unwrap();
    assert_eq!(first.namespace_version, 1);
    assert_eq!(first.status, CacheStatus::Miss);

    store.bump_namespace("products").await;

    // Same filter, new namespace version: the derived key changed, so this
    // is a miss even though the old entry was never deleted.
    let second = coordinator.get_products(&FilterParams::default()).await.unwrap();
    assert_eq!(second.namespace_version, 2);
    assert_eq!(second.status, CacheStatus::Miss);
}

#[tokio::test]
async fn tag_fallback_filters_category_products_manually() {
    let server = MockServer::start().await;

    // Category slug lookup + no subcategories.
    Mock::given(method("GET"))
        .and(path("/products/categories"))
        .and(wiremock::matchers::query_param("slug", "accessories"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!([{"id": 85, "slug": "accessories"}])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/products/categories"))
        .and(wiremock::matchers::query_param("parent", "85"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;

    // The direct tag-filtered query comes back empty.
    Mock::given(method("GET"))
        .and(path("/products"))
        .and(wiremock::matchers::query_param("tag", "gift"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .expect(1)
        .mount(&server)
        .await;

    // The unfiltered category listing carries the taggable products.
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {
                "id": 1, "name": "Gift Strap",
                "tags": [{"slug": "gift"}],
                "categories": [{"id": 85, "slug": "accessories"}]
            },
            {
                "id": 2, "name": "Plain Strap",
                "tags": [{"slug": "basic"}],
                "categories": [{"id": 85, "slug": "accessories"}]
            }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let (coordinator, _) = coordinator_for(&server, CatalogConfig::default());
    let params = FilterParams {
        category: Some("accessories".to_string()),
        tag: Some("gift".to_string()),
        ..Default::default()
    };

    let page = coordinator.get_products(&params).await.unwrap();
    assert_eq!(page.products.len(), 1);
    assert_eq!(page.products[0].id, "1");
}

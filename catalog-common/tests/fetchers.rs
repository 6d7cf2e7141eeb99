use std::sync::Arc;
use std::time::Duration;

use catalog_common::error::FetchError;
use catalog_common::fetcher::{ApiClient, ApiConfig, CatalogFetcher, Fetcher, GeocodeFetcher};
use catalog_common::rate_limit::RateLimiter;
use catalog_common::retry::RetryPolicy;
use http::StatusCode;
use httpmock::{Method::GET, MockServer};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;

fn client(server: &MockServer, name: &str, base_path: &str) -> ApiClient {
    ApiClient::new(
        ApiConfig {
            name: name.to_owned(),
            base_url: Url::parse(&server.url(base_path)).unwrap(),
            timeout: Duration::from_secs(5),
            user_agent: "catalog-pipeline-tests".to_owned(),
        },
        Arc::new(RateLimiter::new()),
        RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50)),
        CancellationToken::new(),
    )
    .unwrap()
}

fn catalog(server: &MockServer) -> CatalogFetcher {
    CatalogFetcher::new(client(server, "catalog", "/api/v2"), 3, 10)
}

#[tokio::test]
async fn test_catalog_pages_until_empty() {
    let server = MockServer::start();

    let first = server.mock(|when, then| {
        when.method(GET)
            .path("/api/v2/search")
            .query_param("categories_tags", "chocolats")
            .query_param("page", "1")
            .query_param("page_size", "3");
        then.status(200).json_body(json!({
            "count": 5,
            "products": [
                {"code": "001", "product_name": "Noir 70%", "brands": "Lindt", "stores": "Carrefour Paris"},
                {"product_name": "no code at all"},
                {"code": "002", "product_name": "Lait", "brands": "Milka, Mondelez"}
            ]
        }));
    });
    let second = server.mock(|when, then| {
        when.method(GET).path("/api/v2/search").query_param("page", "2");
        then.status(200).json_body(json!({
            "products": [
                {"code": "002", "product_name": "Lait again"},
                {"code": "003", "product_name": "Blanc"}
            ]
        }));
    });
    let third = server.mock(|when, then| {
        when.method(GET).path("/api/v2/search").query_param("page", "3");
        then.status(200).json_body(json!({"products": []}));
    });

    let (records, stats) = catalog(&server)
        .fetch_catalog("chocolats", 100)
        .await
        .unwrap();

    first.assert();
    second.assert();
    third.assert();

    let codes: Vec<_> = records.iter().map(|r| r.code.as_str()).collect();
    assert_eq!(codes, vec!["001", "002", "003"]);
    assert_eq!(records[1].product_name.as_deref(), Some("Lait"));
    assert_eq!(records[1].brands, vec!["Milka", "Mondelez"]);

    assert_eq!(stats.pages, 3);
    assert_eq!(stats.requests, 3);
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.records_skipped, 1);
    assert_eq!(stats.duplicates_dropped, 1);
}

#[tokio::test]
async fn test_catalog_stops_at_max_items() {
    let server = MockServer::start();

    let first = server.mock(|when, then| {
        when.method(GET).path("/api/v2/search").query_param("page", "1");
        then.status(200).json_body(json!([
            {"code": "001"},
            {"code": "002"},
            {"code": "003"}
        ]));
    });
    let second = server.mock(|when, then| {
        when.method(GET).path("/api/v2/search").query_param("page", "2");
        then.status(200).json_body(json!([{"code": "004"}]));
    });

    let (records, _) = catalog(&server).fetch_catalog("chocolats", 2).await.unwrap();

    assert_eq!(records.len(), 2);
    first.assert_hits(1);
    second.assert_hits(0);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let server = MockServer::start();

    let not_found = server.mock(|when, then| {
        when.method(GET).path("/api/v2/search");
        then.status(404);
    });

    let partial = catalog(&server)
        .fetch_catalog("chocolats", 100)
        .await
        .unwrap_err();

    not_found.assert_hits(1);
    assert!(partial.records.is_empty());
    assert_eq!(partial.stats.retries, 0);
    assert!(matches!(
        partial.source,
        FetchError::Permanent {
            status: Some(StatusCode::NOT_FOUND),
            ..
        }
    ));
}

#[tokio::test]
async fn test_failure_after_first_page_keeps_records() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(GET).path("/api/v2/search").query_param("page", "1");
        then.status(200)
            .json_body(json!({"products": [{"code": "001"}, {"code": "002"}]}));
    });
    let broken = server.mock(|when, then| {
        when.method(GET).path("/api/v2/search").query_param("page", "2");
        then.status(500);
    });

    let partial = catalog(&server)
        .fetch_catalog("chocolats", 100)
        .await
        .unwrap_err();

    broken.assert_hits(3);
    assert_eq!(partial.records.len(), 2);
    assert_eq!(partial.stats.pages, 1);
    assert_eq!(partial.stats.retries, 2);
    assert!(matches!(
        partial.source,
        FetchError::RetryExhausted { attempts: 3, .. }
    ));
    assert_eq!(
        partial.source.status(),
        Some(StatusCode::INTERNAL_SERVER_ERROR)
    );
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let server = MockServer::start();
    let client = ApiClient::new(
        ApiConfig {
            name: "geocoder".to_owned(),
            base_url: Url::parse(&server.url("/")).unwrap(),
            timeout: Duration::from_secs(5),
            user_agent: "catalog-pipeline-tests".to_owned(),
        },
        Arc::new(RateLimiter::new()),
        RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(1)),
        CancellationToken::new(),
    )
    .unwrap();
    let geocoder = GeocodeFetcher::new(client);

    let mut unavailable = server.mock(|when, then| {
        when.method(GET).path("/search/");
        then.status(503);
    });

    // Swap the failing mock for a healthy one while the client backs off.
    let recover = async {
        while unavailable.hits_async().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        unavailable.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/search/");
                then.status(200).json_body(json!({
                    "features": [{
                        "geometry": {"coordinates": [2.35, 48.85]},
                        "properties": {"score": 0.75, "city": "Paris", "postcode": "75004"}
                    }]
                }));
            })
            .await
    };

    let (result, healthy) = tokio::join!(geocoder.fetch("hotel de ville paris".to_owned()), recover);

    let result = result.unwrap();
    healthy.assert_hits(1);
    assert!(result.matched);
    assert_eq!(result.postal_code.as_deref(), Some("75004"));
    assert_eq!(geocoder.client().stats().requests, 2);
    assert_eq!(geocoder.client().stats().retries, 1);
}

#[tokio::test]
async fn test_geocoder_match_and_no_match() {
    let server = MockServer::start();
    let geocoder = GeocodeFetcher::new(client(&server, "geocoder", "/"));

    let found = server.mock(|when, then| {
        when.method(GET)
            .path("/search/")
            .query_param("q", "carrefour paris")
            .query_param("limit", "1");
        then.status(200).json_body(json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [2.3522, 48.8566]},
                "properties": {"label": "Paris", "score": 0.62, "city": "Paris", "postcode": "75001"}
            }]
        }));
    });
    let missing = server.mock(|when, then| {
        when.method(GET).path("/search/").query_param("q", "zzzz");
        then.status(200)
            .json_body(json!({"type": "FeatureCollection", "features": []}));
    });

    let matched = geocoder.fetch("carrefour paris".to_owned()).await.unwrap();
    let unmatched = geocoder.fetch("zzzz".to_owned()).await.unwrap();
    let empty = geocoder.fetch("   ".to_owned()).await.unwrap();

    found.assert();
    missing.assert();
    assert!(matched.matched);
    assert_eq!(matched.latitude, Some(48.8566));
    assert_eq!(matched.longitude, Some(2.3522));
    assert_eq!(matched.confidence, 0.62);
    assert!(!unmatched.matched);
    assert_eq!(unmatched.latitude, None);
    assert!(!empty.matched);
    assert_eq!(geocoder.client().stats().requests, 2);
}

#[tokio::test]
async fn test_throttled_requests_exhaust_retries() {
    let server = MockServer::start();
    let geocoder = GeocodeFetcher::new(client(&server, "geocoder", "/"));

    let throttled = server.mock(|when, then| {
        when.method(GET).path("/search/");
        then.status(429).header("Retry-After", "0");
    });

    let error = geocoder.fetch("paris".to_owned()).await.unwrap_err();

    throttled.assert_hits(3);
    assert_eq!(error.status(), Some(StatusCode::TOO_MANY_REQUESTS));
}

#[tokio::test]
async fn test_cancelled_client_sends_nothing() {
    let server = MockServer::start();
    let cancel = CancellationToken::new();
    let client = ApiClient::new(
        ApiConfig {
            name: "geocoder".to_owned(),
            base_url: Url::parse(&server.url("/")).unwrap(),
            timeout: Duration::from_secs(5),
            user_agent: "catalog-pipeline-tests".to_owned(),
        },
        Arc::new(RateLimiter::new()),
        RetryPolicy::default(),
        cancel.clone(),
    )
    .unwrap();

    let any = server.mock(|when, then| {
        when.method(GET);
        then.status(200).json_body(json!({"features": []}));
    });

    cancel.cancel();
    let error = GeocodeFetcher::new(client)
        .fetch("paris".to_owned())
        .await
        .unwrap_err();

    assert!(matches!(error, FetchError::Cancelled));
    any.assert_hits(0);
}

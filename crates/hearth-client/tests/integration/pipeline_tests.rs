use std::sync::Arc;

use hearth_client::sources::{OpenDataConfig, OpenDataSource};
use hearth_core::error::AppError;
use hearth_core::orchestrator::Orchestrator;
use hearth_core::source::Source;
use hearth_core::store::MemoryStore;
use hearth_core::traits::Fetcher;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, headers, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::direct_fetcher;

const LISTINGS: &str = r#"{"results": [
    {"id": "a1", "address": "1 Pine St", "price": 500000, "latitude": 40.70, "longitude": -74.01},
    {"id": "a2", "address": "2 Pine St", "price": "650,000", "latitude": 40.71, "longitude": -74.02},
    {"id": "a3", "address": "3 Pine St", "price": 0}
]}"#;

fn listing_source(server: &MockServer, name: &str, route: &str) -> Arc<dyn Source> {
    let mut config = OpenDataConfig::new(
        name,
        format!("{}{route}", server.uri()),
        "United States",
        "New York",
    );
    config.results_path = Some("results".into());
    Arc::new(OpenDataSource::new(config, direct_fetcher()))
}

#[tokio::test]
async fn fetcher_gives_up_after_max_retries_on_503() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = direct_fetcher()
        .fetch(&CancellationToken::new(), &format!("{}/flaky", server.uri()))
        .await
        .unwrap_err();

    match err {
        AppError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, AppError::HttpStatus { status: 503, .. }));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn fetcher_does_not_retry_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let err = direct_fetcher()
        .fetch(&CancellationToken::new(), &server.uri())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::HttpStatus { status: 404, .. }));
}

#[tokio::test]
async fn fetcher_sends_browser_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("user-agent", "hearth-test/1.0"))
        .and(headers("accept-language", vec!["en-US", "en;q=0.9"]))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let body = direct_fetcher()
        .fetch(&CancellationToken::new(), &server.uri())
        .await
        .unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn harvest_is_idempotent_per_natural_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/listings.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LISTINGS))
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let orchestrator = Orchestrator::new(
        vec![listing_source(&server, "pine_street", "/listings.json")],
        store.clone(),
    );

    let first = orchestrator
        .run_all(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.total_saved(), 2);
    let ids: Vec<Option<i64>> = store.all().iter().map(|p| p.id).collect();

    let second = orchestrator
        .run_all(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.total_saved(), 2);
    assert_eq!(store.len(), 2);
    assert_eq!(
        store.all().iter().map(|p| p.id).collect::<Vec<_>>(),
        ids
    );

    let a2 = store.find_by_key("pine_street", "a2").unwrap();
    assert_eq!(a2.price, 650_000.0);
}

#[tokio::test]
async fn failing_source_does_not_stop_the_others() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/good.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LISTINGS))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone.json"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let orchestrator = Orchestrator::new(
        vec![
            listing_source(&server, "alpha", "/gone.json"),
            listing_source(&server, "beta", "/good.json"),
        ],
        store.clone(),
    );

    let err = orchestrator
        .run_all_concurrent(&CancellationToken::new(), 2)
        .await
        .unwrap_err();

    match err {
        AppError::SourcesFailed { failed, total } => {
            assert_eq!(failed, vec!["alpha".to_string()]);
            assert_eq!(total, 2);
        }
        other => panic!("expected SourcesFailed, got {other:?}"),
    }
    assert_eq!(store.len(), 2);
    assert!(store.all().iter().all(|p| p.source == "beta"));

    let alpha = orchestrator.metrics().source_snapshot("alpha").unwrap();
    assert_eq!(alpha.errors, 1);
}

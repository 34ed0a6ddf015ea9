use hearth_core::enrichment::{BaselineScorer, ScoringEnricher};
use hearth_core::models::{Property, PropertyFactors};
use hearth_core::traits::Enricher;
use hearth_db::PgPropertyRepository;

use crate::integration::common::setup_test_db;

fn listing(source: &str, external_id: &str, price: f64) -> Property {
    let mut p = Property::new(source, external_id);
    p.country = "United States".into();
    p.city = "New York".into();
    p.address = "10 Hudson St".into();
    p.latitude = 40.7168;
    p.longitude = -74.0086;
    p.property_type = "apartment".into();
    p.price = price;
    p.currency = "USD".into();
    p.rooms = 3;
    p.images = vec!["https://img.example.com/1.jpg".into()];
    p
}

#[tokio::test]
#[ignore = "requires docker"]
async fn upsert_assigns_identity_and_round_trips() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgPropertyRepository::new(pool);

    let saved = repo
        .upsert_batch(&[listing("nyc_opendata", "a1", 500_000.0)])
        .await
        .unwrap();
    assert_eq!(saved.len(), 1);
    let id = saved[0].id.expect("id assigned");

    let found = repo
        .find_by_id(id)
        .await
        .unwrap()
        .expect("Should find the listing");
    assert_eq!(found.external_id, "a1");
    assert_eq!(found.price, 500_000.0);
    assert_eq!(found.rooms, 3);
    assert_eq!(found.images, vec!["https://img.example.com/1.jpg"]);
    assert!(found.created_at.is_some());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn upsert_is_idempotent_per_natural_key() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgPropertyRepository::new(pool);

    let first = repo
        .upsert_batch(&[listing("nyc_opendata", "a1", 500_000.0)])
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let second = repo
        .upsert_batch(&[listing("nyc_opendata", "a1", 525_000.0)])
        .await
        .unwrap();

    assert_eq!(first[0].id, second[0].id);
    assert_eq!(first[0].created_at, second[0].created_at);
    assert!(second[0].updated_at > first[0].updated_at);
    assert_eq!(second[0].price, 525_000.0);
    assert_eq!(repo.count().await.unwrap(), 1);

    // Same external id under another source is a different listing.
    repo.upsert_batch(&[listing("other_source", "a1", 1.0)])
        .await
        .unwrap();
    assert_eq!(repo.count().await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn failed_batch_writes_nothing() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgPropertyRepository::new(pool);

    let mut bad = listing("nyc_opendata", "too-long", 1.0);
    bad.currency = "X".repeat(50);

    let result = repo
        .upsert_batch(&[listing("nyc_opendata", "ok", 1.0), bad])
        .await;

    assert!(result.is_err());
    assert_eq!(repo.count().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn heatmap_listings_join_factors() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgPropertyRepository::new(pool);

    let mut no_coords = listing("nyc_opendata", "c", 300_000.0);
    no_coords.latitude = 0.0;
    no_coords.longitude = 0.0;

    let saved = repo
        .upsert_batch(&[
            listing("nyc_opendata", "a", 100_000.0),
            listing("nyc_opendata", "b", 200_000.0),
            no_coords,
        ])
        .await
        .unwrap();

    repo.save_factors(&PropertyFactors {
        property_id: saved[0].id.unwrap(),
        overall_score: 80.0,
        details: serde_json::json!({"stations": 2}),
        ..Default::default()
    })
    .await
    .unwrap();

    let factors = repo.find_factors(saved[0].id.unwrap()).await.unwrap().unwrap();
    assert_eq!(factors.overall_score, 80.0);
    assert_eq!(factors.details, serde_json::json!({"stations": 2}));

    let points = repo.heatmap_listings(Some("New York")).await.unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0].1, Some(80.0));
    assert_eq!(points[1].1, None);

    assert!(repo.heatmap_listings(Some("Boston")).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn scoring_enricher_persists_through_repository() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgPropertyRepository::new(pool);
    let enricher = ScoringEnricher::new(BaselineScorer::default(), repo.clone());

    let saved = repo
        .upsert_batch(&[listing("nyc_opendata", "scored", 100_000.0)])
        .await
        .unwrap();
    let factors = enricher.compute_factors(&saved[0]).await.unwrap();
    enricher.save_factors(&factors).await.unwrap();
    // Saving again replaces the row instead of failing on the unique key.
    enricher.save_factors(&factors).await.unwrap();

    let stored = repo.find_factors(saved[0].id.unwrap()).await.unwrap().unwrap();
    assert_eq!(stored.overall_score, 66.75);

    let points = repo.heatmap_listings(Some("New York")).await.unwrap();
    assert_eq!(points[0].1, Some(66.75));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn health_check_succeeds() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgPropertyRepository::new(pool);
    repo.health_check().await.unwrap();
}

use serde_json::json;
use sqlx::PgPool;

use incident_ingest::{
    error::PrimaryStoreError,
    sink::{InsertOutcome, PgIncidentStore, PrimaryStore},
    test_utils::incident,
};

async fn count(pool: &PgPool, key: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM incidents WHERE incident_hash = $1")
        .bind(key)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test(migrations = "./migrations")]
async fn persisting_twice_keeps_one_row(db: PgPool) {
    let store = PgIncidentStore::new(db.clone());
    let incident = incident("eq1");

    assert_eq!(
        store.insert(&incident).await.unwrap(),
        InsertOutcome::Inserted
    );
    assert_eq!(
        store.insert(&incident).await.unwrap(),
        InsertOutcome::AlreadyPresent
    );
    assert_eq!(count(&db, &incident.canonical_key).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn stores_enrichment_and_raw_payload(db: PgPool) {
    let store = PgIncidentStore::new(db.clone());
    let incident = incident("eq1");
    store.insert(&incident).await.unwrap();

    let (severity, geo_bucket, raw_payload): (f64, Option<String>, serde_json::Value) =
        sqlx::query_as(
            "SELECT severity, geo_bucket, raw_payload FROM incidents WHERE incident_hash = $1",
        )
        .bind(&incident.canonical_key)
        .fetch_one(&db)
        .await
        .unwrap();

    assert_eq!(severity, incident.severity);
    assert_eq!(geo_bucket, incident.geo_bucket);
    assert_eq!(raw_payload, incident.raw_payload);
}

#[sqlx::test(migrations = "./migrations")]
async fn missing_coordinates_are_stored_as_null(db: PgPool) {
    let store = PgIncidentStore::new(db.clone());
    let mut incident = incident("g1");
    incident.canonical_key = "f".repeat(64);
    incident.lat = None;
    incident.lon = None;
    incident.magnitude = None;
    incident.geo_bucket = None;
    store.insert(&incident).await.unwrap();

    let (lat, geo_bucket): (Option<f64>, Option<String>) =
        sqlx::query_as("SELECT lat, geo_bucket FROM incidents WHERE incident_hash = $1")
            .bind(&incident.canonical_key)
            .fetch_one(&db)
            .await
            .unwrap();
    assert_eq!(lat, None);
    assert_eq!(geo_bucket, None);
}

#[sqlx::test(migrations = "./migrations")]
async fn rows_postgres_cannot_hold_are_rejected(db: PgPool) {
    let store = PgIncidentStore::new(db.clone());

    let mut bad_title = incident("nul1");
    bad_title.title = "Flood\u{0}near Mumbai".to_string();
    let err = store.insert(&bad_title).await.unwrap_err();
    assert!(err.is_permanent(), "{err}");

    let mut bad_payload = incident("nul2");
    bad_payload.raw_payload = json!({"note": "a\u{0}b"});
    let err = store.insert(&bad_payload).await.unwrap_err();
    assert!(matches!(err, PrimaryStoreError::Rejected(_)), "{err}");

    // the pool is still usable afterwards
    let incident = incident("eq1");
    assert_eq!(
        store.insert(&incident).await.unwrap(),
        InsertOutcome::Inserted
    );
}

#[sqlx::test(migrations = false)]
async fn migrate_is_repeatable(db: PgPool) {
    let store = PgIncidentStore::new(db.clone());
    store.migrate().await.unwrap();
    store.migrate().await.unwrap();

    let incident = incident("eq1");
    assert_eq!(
        store.insert(&incident).await.unwrap(),
        InsertOutcome::Inserted
    );
}

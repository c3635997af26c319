//! PostgreSQL integration tests for the saga log.
//!
//! These tests share one PostgreSQL container and truncate the table between
//! cases, so they run serially. Run with:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration
//! ```

use std::sync::Arc;

use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreError, PostgresEventStore, SagaId,
    Version,
};
use serial_test::serial;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let store = PostgresEventStore::connect(&connection_string, 1)
                .await
                .unwrap();
            store.run_migrations().await.unwrap();
            store.pool().close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;
    let store = PostgresEventStore::connect(&info.connection_string, 5)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_events")
        .execute(store.pool())
        .await
        .unwrap();

    store
}

fn create_test_event(stream_id: SagaId, version: Version, event_type: &str) -> EventEnvelope {
    EventEnvelope::builder()
        .stream_id(stream_id)
        .stream_type("OrderPlacementSaga")
        .event_type(event_type)
        .version(version)
        .payload_raw(serde_json::json!({"type": event_type}))
        .metadata("source", serde_json::json!("test"))
        .build()
        .unwrap()
}

#[tokio::test]
#[serial]
async fn test_append_and_load_stream() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    let version = store
        .append(
            vec![create_test_event(saga_id, Version::first(), "SagaStarted")],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();
    assert_eq!(version, Version::first());

    let events = store.load_stream(saga_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "SagaStarted");
    assert_eq!(events[0].stream_id, saga_id);
    assert_eq!(
        events[0].metadata.get("source"),
        Some(&serde_json::json!("test"))
    );
}

#[tokio::test]
#[serial]
async fn test_batch_append_is_ordered() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    let events = vec![
        create_test_event(saga_id, Version::new(1), "SagaStarted"),
        create_test_event(saga_id, Version::new(2), "ValidationStarted"),
        create_test_event(saga_id, Version::new(3), "ValidationPassed"),
    ];
    let version = store
        .append(events, AppendOptions::expect_new())
        .await
        .unwrap();
    assert_eq!(version, Version::new(3));

    let loaded = store.load_stream(saga_id).await.unwrap();
    let types: Vec<_> = loaded.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["SagaStarted", "ValidationStarted", "ValidationPassed"]
    );
}

#[tokio::test]
#[serial]
async fn test_stale_expected_version_conflicts() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    store
        .append(
            vec![create_test_event(saga_id, Version::first(), "SagaStarted")],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

    let result = store
        .append(
            vec![create_test_event(saga_id, Version::new(2), "ValidationStarted")],
            AppendOptions::expect_version(Version::initial()),
        )
        .await;

    match result {
        Err(EventStoreError::ConcurrencyConflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, Version::initial());
            assert_eq!(actual, Version::first());
        }
        other => panic!("expected a concurrency conflict, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn test_duplicate_version_hits_unique_constraint() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    store
        .append(
            vec![create_test_event(saga_id, Version::first(), "SagaStarted")],
            AppendOptions::new(),
        )
        .await
        .unwrap();

    let result = store
        .append(
            vec![create_test_event(saga_id, Version::first(), "SagaStarted")],
            AppendOptions::new(),
        )
        .await;

    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { .. })
    ));
}

#[tokio::test]
#[serial]
async fn test_stream_ids_and_per_stream_loads() {
    let store = get_test_store().await;
    let first = SagaId::new();
    let second = SagaId::new();

    store
        .append(
            vec![create_test_event(first, Version::first(), "SagaStarted")],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();
    store
        .append(
            vec![create_test_event(second, Version::first(), "SagaStarted")],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();
    store
        .append(
            vec![create_test_event(first, Version::new(2), "ValidationStarted")],
            AppendOptions::expect_version(Version::first()),
        )
        .await
        .unwrap();

    let ids = store.stream_ids("OrderPlacementSaga").await.unwrap();
    assert_eq!(ids, vec![first, second]);
    assert!(store.stream_ids("OtherSaga").await.unwrap().is_empty());

    let versions: Vec<_> = store
        .load_stream(first)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec![Version::new(1), Version::new(2)]);
    assert_eq!(store.load_stream(second).await.unwrap().len(), 1);
    assert!(store.load_stream(SagaId::new()).await.unwrap().is_empty());
}

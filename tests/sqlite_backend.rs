//! SQLite-backed store tests.

mod common;

use common::{event, next_events, test_config};
use std::sync::Arc;
use std::time::Duration;
use stream_store::{
    Checkpoint, ExpectedVersion, ManualClock, NotifierFactory, PageReadStatus, Store, StoreConfig,
    StoreError, StreamMetadata, StreamVersion, SubscriptionConfig, Timestamp,
};
use tempfile::TempDir;

fn sqlite_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        connection: dir.path().join("events.db").to_string_lossy().into_owned(),
        ..test_config("sqlite")
    }
}

async fn open_store(config: StoreConfig) -> Store {
    let store = Store::open_sqlite(config).unwrap();
    store.initialize(false).await.unwrap();
    store
}

// --- Basic Operations ---

#[tokio::test]
async fn test_append_and_read_back() {
    let dir = TempDir::new().unwrap();
    let store = open_store(sqlite_config(&dir)).await;
    store.initialize(false).await.unwrap();

    let batch = vec![event("opened", 0), event("deposited", 1).with_metadata(b"{\"by\":\"atm\"}".to_vec())];
    let result = store.append("account-7", ExpectedVersion::NoStream, &batch).await.unwrap();
    assert_eq!(result.current_version, StreamVersion(1));
    assert_eq!(result.current_checkpoint, Checkpoint(1));

    let page = store.read_stream_forwards("account-7", StreamVersion(0), 10).await.unwrap();
    assert_eq!(page.status, PageReadStatus::Success);
    assert_eq!(page.events.len(), 2);
    assert_eq!(page.events[0].event_id, batch[0].event_id);
    assert_eq!(page.events[1].event_type, "deposited");
    assert_eq!(page.events[1].payload, batch[1].payload);
    assert_eq!(page.events[1].metadata, batch[1].metadata);
    assert_eq!(page.last_stream_checkpoint, Some(Checkpoint(1)));
    assert!(page.events[0].created.0 > 0);

    let value: serde_json::Value = page.events[0].payload_json().unwrap();
    assert_eq!(value["n"], 0);
}

#[tokio::test]
async fn test_reads_across_streams_and_directions() {
    let dir = TempDir::new().unwrap();
    let store = open_store(sqlite_config(&dir)).await;

    for n in 0..6 {
        let stream = if n % 2 == 0 { "even" } else { "odd" };
        store.append(stream, ExpectedVersion::Any, &[event("x", n)]).await.unwrap();
    }

    let forwards = store.read_all_forwards(Checkpoint(2), 3).await.unwrap();
    let seen: Vec<u64> = forwards.events.iter().map(|e| e.checkpoint.0).collect();
    assert_eq!(seen, vec![2, 3, 4]);
    assert!(!forwards.is_end);
    assert_eq!(forwards.next_checkpoint, Some(Checkpoint(5)));

    let backwards = store.read_all_backwards(None, 10).await.unwrap();
    assert_eq!(backwards.events.first().map(|e| e.checkpoint), Some(Checkpoint(5)));
    assert!(backwards.is_end);

    let odd = store.read_stream_backwards("odd", None, 2).await.unwrap();
    let versions: Vec<u64> = odd.events.iter().map(|e| e.stream_version.0).collect();
    assert_eq!(versions, vec![2, 1]);
    assert_eq!(odd.next_version, Some(StreamVersion(0)));

    let missing = store.read_stream_forwards("neither", StreamVersion(0), 10).await.unwrap();
    assert_eq!(missing.status, PageReadStatus::StreamNotFound);
}

#[tokio::test]
async fn test_conflict_and_replay() {
    let dir = TempDir::new().unwrap();
    let store = open_store(sqlite_config(&dir)).await;

    let batch = vec![event("x", 0), event("x", 1)];
    let first = store.append("s", ExpectedVersion::NoStream, &batch).await.unwrap();
    let replay = store.append("s", ExpectedVersion::NoStream, &batch).await.unwrap();
    assert_eq!(first, replay);

    let conflict = store
        .append("s", ExpectedVersion::Exact(StreamVersion(0)), &[event("x", 2)])
        .await;
    assert!(matches!(
        conflict,
        Err(StoreError::ConcurrencyConflict { actual: Some(StreamVersion(1)), .. })
    ));
    assert_eq!(store.stream_event_count("s", None).await.unwrap(), 2);
}

#[tokio::test]
async fn test_events_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(sqlite_config(&dir)).await;
        store.append("s", ExpectedVersion::Any, &[event("x", 0)]).await.unwrap();
        store.dispose().await;
    }

    let store = open_store(sqlite_config(&dir)).await;
    assert_eq!(store.read_head_checkpoint().await.unwrap(), Some(Checkpoint(0)));
    let next = store
        .append("s", ExpectedVersion::Exact(StreamVersion(0)), &[event("x", 1)])
        .await
        .unwrap();
    assert_eq!(next.current_checkpoint, Checkpoint(1));
}

#[tokio::test]
async fn test_metadata_persisted() {
    let dir = TempDir::new().unwrap();
    let store = open_store(sqlite_config(&dir)).await;

    let metadata = StreamMetadata {
        max_age: Some(Duration::from_secs(3600)),
        max_count: Some(10),
        custom_json: Some(serde_json::json!({ "tier": "gold" })),
    };
    store.set_stream_metadata("s", metadata.clone()).await.unwrap();

    let reopened = open_store(sqlite_config(&dir)).await;
    assert_eq!(reopened.get_stream_metadata("s").await.unwrap(), metadata);
}

// --- Schemas and Clocks ---

#[tokio::test]
async fn test_non_default_schema_is_isolated() {
    let dir = TempDir::new().unwrap();
    let main = open_store(sqlite_config(&dir)).await;
    let tenant = open_store(StoreConfig {
        schema: "tenant_a".into(),
        ..sqlite_config(&dir)
    })
    .await;

    assert!(dir.path().join("events.tenant_a.db").exists());

    main.append("s", ExpectedVersion::Any, &[event("main", 0)]).await.unwrap();
    tenant.append("s", ExpectedVersion::Any, &[event("tenant", 0), event("tenant", 1)]).await.unwrap();

    assert_eq!(main.read_head_checkpoint().await.unwrap(), Some(Checkpoint(0)));
    assert_eq!(tenant.read_head_checkpoint().await.unwrap(), Some(Checkpoint(1)));

    let page = tenant.read_stream_forwards("s", StreamVersion(0), 10).await.unwrap();
    assert!(page.events.iter().all(|e| e.event_type == "tenant"));
}

#[tokio::test]
async fn test_keyword_schema_name_works() {
    let dir = TempDir::new().unwrap();
    let store = open_store(StoreConfig {
        schema: "select".into(),
        ..sqlite_config(&dir)
    })
    .await;

    store.append("s", ExpectedVersion::Any, &[event("x", 0)]).await.unwrap();
    assert_eq!(store.read_head_checkpoint().await.unwrap(), Some(Checkpoint(0)));
    assert!(dir.path().join("events.select.db").exists());
}

#[test]
fn test_builtin_database_names_rejected_as_schema() {
    let dir = TempDir::new().unwrap();
    for schema in ["temp", "TEMP", "Main"] {
        let result = Store::open_sqlite(StoreConfig {
            schema: schema.into(),
            ..sqlite_config(&dir)
        });
        assert!(
            matches!(result, Err(StoreError::InvalidConfiguration(_))),
            "schema {:?}",
            schema
        );
    }
}

#[tokio::test]
async fn test_schema_file_created_only_by_initialize() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_sqlite(StoreConfig {
        schema: "tenant_b".into(),
        ..sqlite_config(&dir)
    })
    .unwrap();
    let schema_file = dir.path().join("events.tenant_b.db");

    assert!(matches!(
        store.read_head_checkpoint().await,
        Err(StoreError::Backend(_))
    ));
    store.drop_all(false).await.unwrap();
    assert!(!schema_file.exists());

    store.initialize(false).await.unwrap();
    assert!(schema_file.exists());
    assert_eq!(store.read_head_checkpoint().await.unwrap(), None);
}

#[tokio::test]
async fn test_client_clock_sets_created() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Timestamp(1_700_000_000_000_000)));
    let store = open_store(StoreConfig {
        clock: Some(clock.clone()),
        ..sqlite_config(&dir)
    })
    .await;

    store.append("s", ExpectedVersion::Any, &[event("x", 0)]).await.unwrap();
    clock.advance(Duration::from_secs(10));
    store.append("s", ExpectedVersion::Any, &[event("x", 1)]).await.unwrap();

    let page = store.read_stream_forwards("s", StreamVersion(0), 10).await.unwrap();
    assert_eq!(page.events[0].created, Timestamp(1_700_000_000_000_000));
    assert_eq!(page.events[1].created, Timestamp(1_700_000_010_000_000));

    let before = Timestamp(1_700_000_005_000_000);
    assert_eq!(store.stream_event_count("s", Some(before)).await.unwrap(), 1);
}

// --- Lifecycle ---

#[tokio::test]
async fn test_initialize_unreachable_database() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_sqlite(StoreConfig {
        connection: dir.path().join("missing/dir/events.db").to_string_lossy().into_owned(),
        ..test_config("unreachable")
    })
    .unwrap();

    assert!(store.initialize(true).await.is_ok());
    let err = store.initialize(false).await.unwrap_err();
    assert!(err.is_transient(), "unexpected error {:?}", err);
}

#[tokio::test]
async fn test_drop_all_then_reinitialize() {
    let dir = TempDir::new().unwrap();
    let store = open_store(sqlite_config(&dir)).await;
    store.append("s", ExpectedVersion::Any, &[event("x", 0)]).await.unwrap();

    store.drop_all(false).await.unwrap();
    store.drop_all(false).await.unwrap();
    assert!(matches!(
        store.read_head_checkpoint().await,
        Err(StoreError::Backend(_))
    ));

    store.initialize(false).await.unwrap();
    assert_eq!(store.read_head_checkpoint().await.unwrap(), None);
}

// --- Subscriptions ---

#[tokio::test]
async fn test_polling_sees_writes_from_another_store() {
    let dir = TempDir::new().unwrap();
    let reader = open_store(StoreConfig {
        notifier_factory: Some(NotifierFactory::polling(Duration::from_millis(10))),
        ..sqlite_config(&dir)
    })
    .await;
    let writer = open_store(sqlite_config(&dir)).await;

    let mut handle = reader
        .subscribe_to_all("cross-process", None, SubscriptionConfig::default())
        .unwrap();
    for n in 0..3 {
        writer.append("s", ExpectedVersion::Any, &[event("x", n)]).await.unwrap();
    }

    let events = next_events(&mut handle, 3).await;
    let seen: Vec<u64> = events.iter().map(|e| e.checkpoint.0).collect();
    assert_eq!(seen, vec![0, 1, 2]);

    handle.dispose().await;
    reader.dispose().await;
}

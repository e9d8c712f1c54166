//! Optimistic writes, rollback, negative caching and store failures

mod common;

use chrono::{TimeZone, Utc};
use common::{meeting_doc, meeting_key, start_layer, Recorder};
use serde_json::json;
use std::time::Duration;
use teamboard_core::types::{EntityKey, EntityKind, QuerySpec, Team};
use teamboard_core::{SyncConfig, SyncError, SyncEvent};

#[tokio::test(start_paused = true)]
async fn test_rejected_write_rolls_back_and_notifies() {
    let (store, layer) = start_layer(SyncConfig::default()).await;
    let mut events = layer.event_bus().subscribe();
    store.upsert(meeting_key("m1"), meeting_doc("T1", "U1", "2026-03-01"));
    layer.read(EntityKind::Meeting, "m1").await.unwrap();

    let recorder = Recorder::new();
    let _handle = layer
        .live_subscribe(
            QuerySpec::new(EntityKind::Meeting).filter("teamId", "T1"),
            recorder.observer(),
        )
        .unwrap();

    store.reject_next_write();
    let mut edited = meeting_doc("T1", "U1", "2026-03-01");
    edited["title"] = json!("Renamed");
    let err = layer
        .write(EntityKind::Meeting, "m1", edited)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    assert_eq!(
        layer.peek_cached(&meeting_key("m1")).unwrap()["title"],
        "Meeting of T1"
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let update = recorder.last().unwrap();
    assert_eq!(update.changed_keys, vec![meeting_key("m1")]);
    assert_eq!(update.documents[0].value["title"], "Meeting of T1");

    let mut rolled_back = false;
    while let Ok(event) = events.try_recv() {
        if event == SyncEvent::WriteRolledBack(meeting_key("m1")) {
            rolled_back = true;
        }
    }
    assert!(rolled_back);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_create_leaves_nothing_cached() {
    let (store, layer) = start_layer(SyncConfig::default()).await;
    store.reject_next_write();

    let result = layer
        .write(EntityKind::Meeting, "new", meeting_doc("T1", "U1", "2026-03-01"))
        .await;
    assert!(result.is_err());
    assert!(layer.peek_cached(&meeting_key("new")).is_none());
    assert!(store.get(&meeting_key("new")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_successful_write_is_visible_immediately() {
    let (store, layer) = start_layer(SyncConfig::default()).await;
    let written = layer
        .write(EntityKind::Meeting, "m1", meeting_doc("T1", "U1", "2026-03-01"))
        .await
        .unwrap();
    assert_eq!(written.key, meeting_key("m1"));

    let fetches = store.entity_fetch_count();
    let read = layer.read(EntityKind::Meeting, "m1").await.unwrap();
    assert_eq!(read.value, written.value);
    assert_eq!(store.entity_fetch_count(), fetches);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_cached_then_expires() {
    let config = SyncConfig::new().with_negative_ttl(Duration::from_secs(30));
    let (store, layer) = start_layer(config).await;

    let err = layer.read(EntityKind::Team, "ghost").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(store.entity_fetch_count(), 1);

    assert!(layer.read(EntityKind::Team, "ghost").await.unwrap_err().is_not_found());
    assert_eq!(store.entity_fetch_count(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    store.upsert(
        EntityKey::new(EntityKind::Team, "ghost"),
        json!({"name": "Appeared"}),
    );
    let found = layer.read(EntityKind::Team, "ghost").await.unwrap();
    assert_eq!(found.value["name"], "Appeared");
    assert_eq!(store.entity_fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_local_create_clears_negative_entry() {
    let (_store, layer) = start_layer(SyncConfig::default()).await;
    assert!(layer.read(EntityKind::Team, "t1").await.unwrap_err().is_not_found());

    layer
        .write(EntityKind::Team, "t1", json!({"name": "Core"}))
        .await
        .unwrap();
    let read = layer.read(EntityKind::Team, "t1").await.unwrap();
    assert_eq!(read.value["name"], "Core");
}

#[tokio::test(start_paused = true)]
async fn test_slow_store_times_out() {
    let config = SyncConfig::new().with_fetch_timeout(Duration::from_secs(2));
    let (store, layer) = start_layer(config).await;
    store.upsert(meeting_key("m1"), meeting_doc("T1", "U1", "2026-03-01"));
    store.set_latency(Duration::from_secs(10));

    let err = layer.read(EntityKind::Meeting, "m1").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::FetchTimeout { timeout_ms: 2_000, .. }
    ));
    assert!(layer.peek_cached(&meeting_key("m1")).is_none());

    // a timeout is not a NotFound; the next read tries again
    store.set_latency(Duration::ZERO);
    assert!(layer.read(EntityKind::Meeting, "m1").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_store_surfaces_error() {
    let (store, layer) = start_layer(SyncConfig::default()).await;
    store.set_unavailable(true);

    let err = layer
        .read_query(&QuerySpec::new(EntityKind::Team))
        .await
        .unwrap_err();
    assert!(err.is_upstream());
    assert!(!err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_typed_round_trip_through_layer() {
    let (_store, layer) = start_layer(SyncConfig::default()).await;
    let team = Team {
        id: "T1".to_string(),
        name: "Platform".to_string(),
        owner_id: "U1".to_string(),
        member_ids: vec!["U2".to_string(), "U3".to_string()],
        created_at: Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap(),
    };

    let written = layer.write_as(&team).await.unwrap();
    assert_eq!(written.key, EntityKey::new(EntityKind::Team, "T1"));
    assert_eq!(written.value["ownerId"], "U1");

    let read: Team = layer.read_as("T1").await.unwrap();
    assert_eq!(read, team);
    assert!(read.has_member("U3"));
}

#[tokio::test(start_paused = true)]
async fn test_decode_failure_reports_key() {
    let (store, layer) = start_layer(SyncConfig::default()).await;
    store.upsert(EntityKey::new(EntityKind::Team, "T9"), json!({"name": 42}));

    let err = layer.read_as::<Team>("T9").await.unwrap_err();
    assert!(matches!(err, SyncError::Decode { .. }));
    assert!(err.to_string().contains("team:T9"));
}

#[tokio::test(start_paused = true)]
async fn test_calls_after_shutdown_fail() {
    let (store, layer) = start_layer(SyncConfig::default()).await;
    store.upsert(meeting_key("m1"), meeting_doc("T1", "U1", "2026-03-01"));
    layer.shutdown().await;
    layer.shutdown().await;

    assert!(matches!(
        layer.read(EntityKind::Meeting, "m1").await,
        Err(SyncError::ShutDown)
    ));
    assert!(matches!(
        layer.write(EntityKind::Meeting, "m1", json!({})).await,
        Err(SyncError::ShutDown)
    ));
    assert_eq!(store.get(&meeting_key("m1")).unwrap().value["teamId"], "T1");
}

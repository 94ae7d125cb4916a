//! Tests for repository implementations

use chrono::{Duration, TimeZone, Utc};
use twinsync_core::storage::{
    DeviceStore, KnownEntities, MemoryStore, ObservationStore, SledStore, SubscriptionKey,
    TemplateStore,
};
use twinsync_core::{
    DataType, DeviceId, DeviceRecord, DeviceTemplate, IdentifiedObservation, ObservationSpec,
    ObservationValue, Position, TemplateId,
};

fn observation(mid: &str, id: u32, value: ObservationValue, offset_secs: i64) -> IdentifiedObservation {
    IdentifiedObservation {
        mid: DeviceId::new(mid),
        observation_id: id,
        value,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs),
    }
}

fn template() -> DeviceTemplate {
    DeviceTemplate::new("T1", "Tracker")
        .with_observation(ObservationSpec::new(1, "position", DataType::Position))
        .with_observation(ObservationSpec::new(2, "speed", DataType::Double).aggregated(300))
}

#[tokio::test]
async fn test_sled_devices_and_templates() {
    let store = SledStore::temporary().unwrap();
    store.put_device(&DeviceRecord::new("D1", "T1")).await.unwrap();
    store.put_template(&template()).await.unwrap();

    let device = store.device(&DeviceId::new("D1")).await.unwrap().unwrap();
    assert_eq!(device.template_id, TemplateId::new("T1"));
    assert!(store.device(&DeviceId::new("D2")).await.unwrap().is_none());

    let loaded = store.template(&TemplateId::new("T1")).await.unwrap().unwrap();
    assert_eq!(loaded, template());
    assert_eq!(loaded.observation(2).unwrap().aggregation_window_secs, Some(300));

    assert_eq!(store.list_devices().await.unwrap().len(), 1);
    assert_eq!(store.list_templates().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sled_observations_upsert_and_stay_per_device() {
    let store = SledStore::temporary().unwrap();
    let batch = vec![
        observation("D1", 1, ObservationValue::Position(Position::new(52.1, 4.3, None)), 0),
        observation("D1", 2, ObservationValue::from(12.5), 0),
        observation("D10", 2, ObservationValue::from(99.0), 0),
    ];

    store.persist(&batch).await.unwrap();
    // Redelivered copy of the first batch
    store.persist(&batch[..2]).await.unwrap();

    let d1 = store.observations(&DeviceId::new("D1")).await.unwrap();
    assert_eq!(d1.len(), 2);
    assert_eq!(d1[0].value, batch[0].value);

    // "D1" must not prefix-match "D10"
    let d10 = store.observations(&DeviceId::new("D10")).await.unwrap();
    assert_eq!(d10.len(), 1);
}

#[tokio::test]
async fn test_sled_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("twins.db");
    let path = path.to_str().unwrap();

    {
        let store = SledStore::new(path).unwrap();
        store.put_device(&DeviceRecord::new("D1", "T1")).await.unwrap();
        store
            .persist(&[observation("D1", 2, ObservationValue::from(1.0), 5)])
            .await
            .unwrap();
    }

    let store = SledStore::new(path).unwrap();
    assert!(store.device(&DeviceId::new("D1")).await.unwrap().is_some());
    assert_eq!(store.observations(&DeviceId::new("D1")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_known_entities() {
    let sled = SledStore::temporary().unwrap();
    sled.put_device(&DeviceRecord::new("D1", "T1")).await.unwrap();
    sled.put_user("alice").await.unwrap();
    sled.put_subscription(&SubscriptionKey::new("alice", "dashboard"))
        .await
        .unwrap();

    let memory = MemoryStore::new();
    memory.put_device(DeviceRecord::new("D1", "T1"));
    memory.put_user("alice");
    memory.put_subscription(SubscriptionKey::new("alice", "dashboard"));

    let stores: [&dyn KnownEntities; 2] = [&sled, &memory];
    for store in stores {
        assert!(store.active_devices().await.unwrap().contains(&DeviceId::new("D1")));
        assert!(store.active_users().await.unwrap().contains("alice"));
        assert!(store
            .active_subscriptions()
            .await
            .unwrap()
            .contains(&SubscriptionKey::new("alice", "dashboard")));
    }
}

//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use twinsync_core::broker::MemoryBroker;
use twinsync_core::storage::MemoryStore;
use twinsync_core::{
    ConnectionDescriptor, ConsumerConfig, DataType, DeviceRecord, DeviceTemplate, MetadataCache,
    ObservationMessage, ObservationSpec, TwinHandler,
};

pub const QUEUE: &str = "twin.observations";
pub const CHANGES: &str = "twin.changes";

pub struct Fixture {
    pub broker: MemoryBroker,
    pub store: MemoryStore,
    pub cache: Arc<MetadataCache>,
}

impl Fixture {
    /// D1 → T1, where T1 declares Integer observation 5
    pub fn new() -> Self {
        let store = MemoryStore::new();
        store.put_device(DeviceRecord::new("D1", "T1"));
        store.put_template(
            DeviceTemplate::new("T1", "Counter")
                .with_observation(ObservationSpec::new(5, "count", DataType::Integer)),
        );

        let broker = MemoryBroker::new();
        broker.declare_queue(QUEUE);
        broker.declare_queue(CHANGES);

        let cache = Arc::new(MetadataCache::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        ));

        Self {
            broker,
            store,
            cache,
        }
    }

    pub fn handler(&self, config: ConsumerConfig) -> TwinHandler {
        TwinHandler::new(
            "test-handler",
            descriptor(),
            config,
            Arc::new(self.broker.clone()),
            Arc::clone(&self.cache),
            Arc::new(self.store.clone()),
        )
        .expect("valid config")
    }

    pub fn publish(&self, message: &ObservationMessage) {
        self.broker.publish(QUEUE, message.to_vec()).expect("queue exists");
    }
}

pub fn descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor::parse("localhost,twinsync,secret,false").expect("valid descriptor")
}

pub fn config(batch_size: usize) -> ConsumerConfig {
    ConsumerConfig {
        queue: QUEUE.to_string(),
        prefetch: 10,
        batch_size,
        max_time_in_buffer_secs: 5,
        max_buffered: 100,
        reconnect_cooldown_secs: 2,
        ..ConsumerConfig::default()
    }
}

pub fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(second as i64)
}

/// Poll `check` until it holds, yielding to the broker tasks in between
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

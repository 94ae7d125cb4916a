//! Repository interfaces consumed by the pipeline, plus two backends
//!
//! The backing store is owned by management tooling; the pipeline only reads
//! devices and templates, and appends observations.

pub mod memory_store;
pub mod sled_store;

pub use memory_store::MemoryStore;
pub use sled_store::SledStore;

use crate::model::{DeviceId, DeviceRecord, DeviceTemplate, IdentifiedObservation, TemplateId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Device lookup by MID
#[async_trait::async_trait]
pub trait DeviceStore: Send + Sync {
    async fn device(&self, mid: &DeviceId) -> Result<Option<DeviceRecord>>;

    /// Bulk listing used to warm the cache at startup
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>>;
}

/// Template lookup by TID
#[async_trait::async_trait]
pub trait TemplateStore: Send + Sync {
    async fn template(&self, tid: &TemplateId) -> Result<Option<DeviceTemplate>>;

    async fn list_templates(&self) -> Result<Vec<DeviceTemplate>>;
}

/// Observation persistence
///
/// Writes are upserts keyed by `(mid, observation_id, timestamp)`, so a
/// batch redelivered after a crash does not duplicate stored records.
#[async_trait::async_trait]
pub trait ObservationStore: Send + Sync {
    async fn persist(&self, batch: &[IdentifiedObservation]) -> Result<()>;

    /// Stored observations of one device, oldest first
    async fn observations(&self, mid: &DeviceId) -> Result<Vec<IdentifiedObservation>>;
}

/// User-scoped subscription key (whitelist or persistent topology)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub user_id: String,
    pub key: String,
}

impl SubscriptionKey {
    pub fn new(user_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            key: key.into(),
        }
    }
}

/// Entities that still justify broker topology
#[async_trait::async_trait]
pub trait KnownEntities: Send + Sync {
    async fn active_devices(&self) -> Result<HashSet<DeviceId>>;

    async fn active_users(&self) -> Result<HashSet<String>>;

    async fn active_subscriptions(&self) -> Result<HashSet<SubscriptionKey>>;
}

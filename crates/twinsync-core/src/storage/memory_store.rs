//! In-memory repository for testing and development

use crate::model::{DeviceId, DeviceRecord, DeviceTemplate, IdentifiedObservation, TemplateId};
use crate::storage::{DeviceStore, KnownEntities, ObservationStore, SubscriptionKey, TemplateStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type ObservationKey = (DeviceId, u32, DateTime<Utc>);

/// In-memory repository (non-persistent)
///
/// Counts lookups and persist calls so callers can observe cache behaviour,
/// and can be told to fail the next N persists or device lookups.
#[derive(Clone, Default)]
pub struct MemoryStore {
    devices: Arc<DashMap<DeviceId, DeviceRecord>>,
    templates: Arc<DashMap<TemplateId, DeviceTemplate>>,
    observations: Arc<DashMap<ObservationKey, IdentifiedObservation>>,
    users: Arc<DashSet<String>>,
    subscriptions: Arc<DashSet<SubscriptionKey>>,
    device_lookups: Arc<AtomicU64>,
    template_lookups: Arc<AtomicU64>,
    persist_calls: Arc<AtomicU64>,
    failing_persists: Arc<AtomicUsize>,
    failing_lookups: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_device(&self, device: DeviceRecord) {
        self.devices.insert(device.mid.clone(), device);
    }

    pub fn remove_device(&self, mid: &DeviceId) {
        self.devices.remove(mid);
    }

    pub fn put_template(&self, template: DeviceTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn remove_template(&self, tid: &TemplateId) {
        self.templates.remove(tid);
    }

    pub fn put_user(&self, user_id: impl Into<String>) {
        self.users.insert(user_id.into());
    }

    pub fn put_subscription(&self, key: SubscriptionKey) {
        self.subscriptions.insert(key);
    }

    pub fn remove_subscription(&self, key: &SubscriptionKey) {
        self.subscriptions.remove(key);
    }

    pub fn device_lookups(&self) -> u64 {
        self.device_lookups.load(Ordering::SeqCst)
    }

    pub fn template_lookups(&self) -> u64 {
        self.template_lookups.load(Ordering::SeqCst)
    }

    pub fn persist_calls(&self) -> u64 {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// Number of distinct stored observations
    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    /// Make the next `n` calls to `persist` fail
    pub fn fail_next_persists(&self, n: usize) {
        self.failing_persists.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `device` fail
    pub fn fail_next_lookups(&self, n: usize) {
        self.failing_lookups.store(n, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn device(&self, mid: &DeviceId) -> Result<Option<DeviceRecord>> {
        self.device_lookups.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_lookups) {
            return Err(anyhow!("injected lookup failure"));
        }
        Ok(self.devices.get(mid).map(|d| d.clone()))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.devices.iter().map(|e| e.value().clone()).collect())
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn template(&self, tid: &TemplateId) -> Result<Option<DeviceTemplate>> {
        self.template_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.templates.get(tid).map(|t| t.clone()))
    }

    async fn list_templates(&self) -> Result<Vec<DeviceTemplate>> {
        Ok(self.templates.iter().map(|e| e.value().clone()).collect())
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn persist(&self, batch: &[IdentifiedObservation]) -> Result<()> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);

        if take_failure(&self.failing_persists) {
            return Err(anyhow!("injected persistence failure"));
        }

        for observation in batch {
            self.observations
                .insert(observation.dedup_key(), observation.clone());
        }
        Ok(())
    }

    async fn observations(&self, mid: &DeviceId) -> Result<Vec<IdentifiedObservation>> {
        let mut found: Vec<_> = self
            .observations
            .iter()
            .filter(|e| &e.key().0 == mid)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|o| (o.timestamp, o.observation_id));
        Ok(found)
    }
}

#[async_trait]
impl KnownEntities for MemoryStore {
    async fn active_devices(&self) -> Result<HashSet<DeviceId>> {
        Ok(self.devices.iter().map(|e| e.key().clone()).collect())
    }

    async fn active_users(&self) -> Result<HashSet<String>> {
        Ok(self.users.iter().map(|u| u.key().clone()).collect())
    }

    async fn active_subscriptions(&self) -> Result<HashSet<SubscriptionKey>> {
        Ok(self.subscriptions.iter().map(|s| s.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObservationValue;

    #[tokio::test]
    async fn test_persist_is_idempotent_per_key() {
        let store = MemoryStore::new();
        let observation = IdentifiedObservation {
            mid: DeviceId::new("D1"),
            observation_id: 1,
            value: ObservationValue::from(1),
            timestamp: Utc::now(),
        };

        store.persist(&[observation.clone()]).await.unwrap();
        store.persist(&[observation]).await.unwrap();

        assert_eq!(store.observation_count(), 1);
        assert_eq!(store.persist_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let store = MemoryStore::new();
        store.fail_next_persists(1);
        assert!(store.persist(&[]).await.is_err());
        assert!(store.persist(&[]).await.is_ok());
    }
}

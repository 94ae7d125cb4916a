//! Two-level device metadata cache
//!
//! MID → TID and TID → template, each in its own `DashMap` so device lookups
//! never contend with template lookups. Entries are populated read-through
//! from the repository on miss and only leave through explicit invalidation.
//! Two concurrent misses on the same cold key may both fetch; the last insert
//! wins, which is harmless because resolution is idempotent.

use crate::error::ResolveError;
use crate::message::CacheNotification;
use crate::model::{DeviceId, DeviceTemplate, TemplateId};
use crate::storage::{DeviceStore, TemplateStore};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Read-through cache of device → template resolution
pub struct MetadataCache {
    devices: DashMap<DeviceId, TemplateId>,
    templates: DashMap<TemplateId, Arc<DeviceTemplate>>,
    device_store: Arc<dyn DeviceStore>,
    template_store: Arc<dyn TemplateStore>,
}

impl MetadataCache {
    pub fn new(device_store: Arc<dyn DeviceStore>, template_store: Arc<dyn TemplateStore>) -> Self {
        Self {
            devices: DashMap::new(),
            templates: DashMap::new(),
            device_store,
            template_store,
        }
    }

    /// Warm both key spaces from a bulk listing
    pub async fn preload(&self) -> anyhow::Result<(usize, usize)> {
        let devices = self.device_store.list_devices().await?;
        let templates = self.template_store.list_templates().await?;

        let counts = (devices.len(), templates.len());
        for device in devices {
            self.devices.insert(device.mid, device.template_id);
        }
        for template in templates {
            self.templates.insert(template.id.clone(), Arc::new(template));
        }

        info!(devices = counts.0, templates = counts.1, "Preloaded metadata cache");
        Ok(counts)
    }

    /// Resolve the template a device reports against
    pub async fn resolve_template(&self, mid: &DeviceId) -> Result<Arc<DeviceTemplate>, ResolveError> {
        let tid = self.resolve_device(mid).await?;

        // Copy out of the map before any await
        let cached = self.templates.get(&tid).map(|t| Arc::clone(t.value()));
        if let Some(template) = cached {
            return Ok(template);
        }

        debug!(%mid, %tid, "Template cache miss");
        let template = self
            .template_store
            .template(&tid)
            .await
            .map_err(ResolveError::Repository)?
            .ok_or_else(|| ResolveError::DanglingTemplate {
                mid: mid.clone(),
                tid: tid.clone(),
            })?;

        let template = Arc::new(template);
        self.templates.insert(tid, Arc::clone(&template));
        Ok(template)
    }

    async fn resolve_device(&self, mid: &DeviceId) -> Result<TemplateId, ResolveError> {
        let cached = self.devices.get(mid).map(|t| t.value().clone());
        if let Some(tid) = cached {
            return Ok(tid);
        }

        debug!(%mid, "Device cache miss");
        let record = self
            .device_store
            .device(mid)
            .await
            .map_err(ResolveError::Repository)?
            .ok_or_else(|| ResolveError::UnknownDevice(mid.clone()))?;

        self.devices
            .insert(mid.clone(), record.template_id.clone());
        Ok(record.template_id)
    }

    /// Drop a template definition; it is refetched on next use
    pub fn invalidate_template(&self, tid: &TemplateId) -> bool {
        let removed = self.templates.remove(tid).is_some();
        debug!(%tid, removed, "Invalidated template");
        removed
    }

    /// Drop a device's template mapping; it is refetched on next use
    pub fn invalidate_device(&self, mid: &DeviceId) -> bool {
        let removed = self.devices.remove(mid).is_some();
        debug!(%mid, removed, "Invalidated device");
        removed
    }

    pub fn apply(&self, notification: &CacheNotification) -> bool {
        match notification {
            CacheNotification::DeviceChanged { mid } => self.invalidate_device(mid),
            CacheNotification::TemplateChanged { tid } => self.invalidate_template(tid),
        }
    }

    /// Cached template id for a device, without touching the repository
    pub fn cached_template_id(&self, mid: &DeviceId) -> Option<TemplateId> {
        self.devices.get(mid).map(|t| t.value().clone())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceRecord, ObservationSpec};
    use crate::storage::MemoryStore;
    use crate::value::DataType;

    fn store_with(mid: &str, tid: &str) -> MemoryStore {
        let store = MemoryStore::new();
        store.put_device(DeviceRecord::new(mid, tid));
        store.put_template(
            DeviceTemplate::new(tid, "Thermostat")
                .with_observation(ObservationSpec::new(5, "temperature", DataType::Double)),
        );
        store
    }

    fn cache_over(store: &MemoryStore) -> MetadataCache {
        MetadataCache::new(Arc::new(store.clone()), Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_hits_skip_the_repository() {
        let store = store_with("D1", "T1");
        let cache = cache_over(&store);
        let mid = DeviceId::new("D1");

        for _ in 0..5 {
            let template = cache.resolve_template(&mid).await.unwrap();
            assert_eq!(template.id, TemplateId::new("T1"));
        }

        assert_eq!(store.device_lookups(), 1);
        assert_eq!(store.template_lookups(), 1);
    }

    #[tokio::test]
    async fn test_template_invalidation_refetches_only_the_template() {
        let store = store_with("D1", "T1");
        let cache = cache_over(&store);
        let mid = DeviceId::new("D1");

        cache.resolve_template(&mid).await.unwrap();
        assert!(cache.invalidate_template(&TemplateId::new("T1")));
        cache.resolve_template(&mid).await.unwrap();

        assert_eq!(store.device_lookups(), 1);
        assert_eq!(store.template_lookups(), 2);
    }

    #[tokio::test]
    async fn test_device_invalidation_picks_up_reassignment() {
        let store = store_with("D1", "T1");
        store.put_template(DeviceTemplate::new("T2", "Tracker"));
        let cache = cache_over(&store);
        let mid = DeviceId::new("D1");

        cache.resolve_template(&mid).await.unwrap();
        store.put_device(DeviceRecord::new("D1", "T2"));

        // Stale until told otherwise
        assert_eq!(cache.resolve_template(&mid).await.unwrap().id, TemplateId::new("T1"));

        cache.apply(&CacheNotification::DeviceChanged { mid: mid.clone() });
        assert_eq!(cache.resolve_template(&mid).await.unwrap().id, TemplateId::new("T2"));
        assert_eq!(store.device_lookups(), 2);
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_cached() {
        let store = MemoryStore::new();
        let cache = cache_over(&store);
        let mid = DeviceId::new("ghost");

        let err = cache.resolve_template(&mid).await.unwrap_err();
        assert!(matches!(err, ResolveError::UnknownDevice(_)));
        assert_eq!(cache.device_count(), 0);

        cache.resolve_template(&mid).await.unwrap_err();
        assert_eq!(store.device_lookups(), 2);
    }

    #[tokio::test]
    async fn test_dangling_template_is_a_distinct_error() {
        let store = MemoryStore::new();
        store.put_device(DeviceRecord::new("D1", "missing"));
        let cache = cache_over(&store);

        let err = cache.resolve_template(&DeviceId::new("D1")).await.unwrap_err();
        assert_eq!(err.kind(), "dangling_template");
        assert_eq!(cache.template_count(), 0);
    }

    #[tokio::test]
    async fn test_preload_warms_both_levels() {
        let store = store_with("D1", "T1");
        let cache = cache_over(&store);

        assert_eq!(cache.preload().await.unwrap(), (1, 1));
        cache.resolve_template(&DeviceId::new("D1")).await.unwrap();

        assert_eq!(store.device_lookups(), 0);
        assert_eq!(store.template_lookups(), 0);
    }
}

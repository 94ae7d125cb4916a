//! `Sled`-based repository implementation
//!
//! Uses an embedded database for devices, templates and observations.
//! Observation keys are `mid \0 observation_id(be) timestamp_nanos(be)`, which
//! makes persisting an upsert and keeps one device's history contiguous.

use crate::model::{DeviceId, DeviceRecord, DeviceTemplate, IdentifiedObservation, TemplateId};
use crate::storage::{DeviceStore, KnownEntities, ObservationStore, SubscriptionKey, TemplateStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Db, Tree};
use std::collections::HashSet;

/// `Sled`-based persistent repository
pub struct SledStore {
    db: Db,
    devices: Tree,
    templates: Tree,
    observations: Tree,
    users: Tree,
    subscriptions: Tree,
}

impl SledStore {
    /// Open (or create) a store at `path`
    pub fn new(path: &str) -> Result<Self> {
        let db = sled::open(path).map_err(|e| anyhow!(e))?;
        Self::from_db(db)
    }

    /// Throwaway store backed by a temporary directory
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| anyhow!(e))?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let devices = db.open_tree("devices").map_err(|e| anyhow!(e))?;
        let templates = db.open_tree("templates").map_err(|e| anyhow!(e))?;
        let observations = db.open_tree("observations").map_err(|e| anyhow!(e))?;
        let users = db.open_tree("users").map_err(|e| anyhow!(e))?;
        let subscriptions = db.open_tree("subscriptions").map_err(|e| anyhow!(e))?;

        Ok(Self {
            db,
            devices,
            templates,
            observations,
            users,
            subscriptions,
        })
    }

    pub async fn put_device(&self, device: &DeviceRecord) -> Result<()> {
        self.devices
            .insert(device.mid.as_str().as_bytes(), encode(device)?)
            .map_err(|e| anyhow!(e))?;
        self.db.flush_async().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    pub async fn put_template(&self, template: &DeviceTemplate) -> Result<()> {
        self.templates
            .insert(template.id.as_str().as_bytes(), encode(template)?)
            .map_err(|e| anyhow!(e))?;
        self.db.flush_async().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    pub async fn put_user(&self, user_id: &str) -> Result<()> {
        self.users
            .insert(user_id.as_bytes(), Vec::<u8>::new())
            .map_err(|e| anyhow!(e))?;
        self.db.flush_async().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    pub async fn put_subscription(&self, key: &SubscriptionKey) -> Result<()> {
        self.subscriptions
            .insert(subscription_key(key), encode(key)?)
            .map_err(|e| anyhow!(e))?;
        self.db.flush_async().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    fn decode_all<T: DeserializeOwned>(tree: &Tree) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for item in tree {
            let (_, value) = item.map_err(|e| anyhow!(e))?;
            items.push(decode(&value)?);
        }
        Ok(items)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| anyhow!(e))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map(|(decoded, _)| decoded)
        .map_err(|e| anyhow!(e))
}

fn device_prefix(mid: &DeviceId) -> Vec<u8> {
    let mut key = mid.as_str().as_bytes().to_vec();
    key.push(0);
    key
}

fn observation_key(observation: &IdentifiedObservation) -> Vec<u8> {
    let mut key = device_prefix(&observation.mid);
    key.extend_from_slice(&observation.observation_id.to_be_bytes());
    let nanos = observation
        .timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| observation.timestamp.timestamp_micros().saturating_mul(1_000));
    key.extend_from_slice(&nanos.to_be_bytes());
    key
}

fn subscription_key(key: &SubscriptionKey) -> Vec<u8> {
    let mut raw = key.user_id.as_bytes().to_vec();
    raw.push(0);
    raw.extend_from_slice(key.key.as_bytes());
    raw
}

#[async_trait]
impl DeviceStore for SledStore {
    async fn device(&self, mid: &DeviceId) -> Result<Option<DeviceRecord>> {
        match self
            .devices
            .get(mid.as_str().as_bytes())
            .map_err(|e| anyhow!(e))?
        {
            Some(data) => Ok(Some(decode(&data)?)),
            None => Ok(None),
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        Self::decode_all(&self.devices)
    }
}

#[async_trait]
impl TemplateStore for SledStore {
    async fn template(&self, tid: &TemplateId) -> Result<Option<DeviceTemplate>> {
        match self
            .templates
            .get(tid.as_str().as_bytes())
            .map_err(|e| anyhow!(e))?
        {
            Some(data) => Ok(Some(decode(&data)?)),
            None => Ok(None),
        }
    }

    async fn list_templates(&self) -> Result<Vec<DeviceTemplate>> {
        Self::decode_all(&self.templates)
    }
}

#[async_trait]
impl ObservationStore for SledStore {
    async fn persist(&self, batch: &[IdentifiedObservation]) -> Result<()> {
        let mut writes = Batch::default();
        for observation in batch {
            writes.insert(observation_key(observation), encode(observation)?);
        }

        self.observations
            .apply_batch(writes)
            .map_err(|e| anyhow!(e))?;

        // Flush to ensure durability
        self.db.flush_async().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn observations(&self, mid: &DeviceId) -> Result<Vec<IdentifiedObservation>> {
        let mut found = Vec::new();
        for item in self.observations.scan_prefix(device_prefix(mid)) {
            let (_, value) = item.map_err(|e| anyhow!(e))?;
            found.push(decode::<IdentifiedObservation>(&value)?);
        }
        found.sort_by_key(|o| (o.timestamp, o.observation_id));
        Ok(found)
    }
}

#[async_trait]
impl KnownEntities for SledStore {
    async fn active_devices(&self) -> Result<HashSet<DeviceId>> {
        let devices: Vec<DeviceRecord> = Self::decode_all(&self.devices)?;
        Ok(devices.into_iter().map(|d| d.mid).collect())
    }

    async fn active_users(&self) -> Result<HashSet<String>> {
        let mut users = HashSet::new();
        for item in &self.users {
            let (key, _) = item.map_err(|e| anyhow!(e))?;
            users.insert(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(users)
    }

    async fn active_subscriptions(&self) -> Result<HashSet<SubscriptionKey>> {
        let keys: Vec<SubscriptionKey> = Self::decode_all(&self.subscriptions)?;
        Ok(keys.into_iter().collect())
    }
}

//! Per-delivery observation handling
//!
//! Each delivery is decoded, resolved against its device's template, typed,
//! and appended to an in-process batch before it is acked. The batch is
//! persisted when it reaches the configured size or when the handler forces
//! a flush. A message that cannot be identified is rejected without requeue
//! and never stalls the consumer; one whose metadata lookup failed in the
//! repository is requeued instead.
//!
//! A failed flush keeps the batch. Once the buffer holds `max_buffered`
//! observations, new deliveries are handed back to the broker until a flush
//! succeeds.

use crate::broker::{Channel, Delivery, DeliveryHandler};
use crate::cache::MetadataCache;
use crate::error::{DecodeError, ResolveError, TwinError};
use crate::message::{CacheNotification, ObservationMessage};
use crate::model::{DeviceId, IdentifiedObservation, ObservationSpec};
use crate::statistics::RunningStatistics;
use crate::storage::ObservationStore;
use crate::value::ObservationValue;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How a delivery is settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Drop,
    Requeue,
}

/// Counters exposed for logging and tests
#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
    persisted: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub requeued: u64,
    pub persisted: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
}

/// Open aggregation window for one (device, observation) pair
#[derive(Debug)]
struct Window {
    opened_at: DateTime<Utc>,
    closes_at: DateTime<Utc>,
    statistics: RunningStatistics,
}

impl Window {
    fn open(at: DateTime<Utc>, length: ChronoDuration) -> Self {
        Self {
            opened_at: at,
            closes_at: at + length,
            statistics: RunningStatistics::new(),
        }
    }

    fn close(self, mid: DeviceId, observation_id: u32) -> Option<IdentifiedObservation> {
        let summary = self.statistics.summary()?;
        Some(IdentifiedObservation {
            mid,
            observation_id,
            value: ObservationValue::Statistics(summary),
            timestamp: self.opened_at,
        })
    }
}

#[derive(Debug, Default)]
struct Batch {
    pending: Vec<IdentifiedObservation>,
    windows: HashMap<(DeviceId, u32), Window>,
}

impl Batch {
    fn append(&mut self, observation: IdentifiedObservation, spec: &ObservationSpec) {
        let window = spec
            .aggregation_window_secs
            .filter(|_| spec.data_type.is_numeric());
        let (Some(secs), Some(x)) = (window, observation.value.as_f64()) else {
            self.pending.push(observation);
            return;
        };

        let length = ChronoDuration::seconds(secs.min(u64::from(u32::MAX)) as i64);
        let key = (observation.mid.clone(), observation.observation_id);
        let at = observation.timestamp;

        let expired = self
            .windows
            .get(&key)
            .is_some_and(|w| at >= w.closes_at);
        if expired {
            if let Some(closed) = self.windows.remove(&key) {
                self.pending.extend(closed.close(key.0.clone(), key.1));
            }
        }

        self.windows
            .entry(key)
            .or_insert_with(|| Window::open(at, length))
            .statistics
            .push_at(x, at);
    }

    /// Move windows that ended by `cutoff` into the pending batch; `None`
    /// closes all of them
    fn close_windows(&mut self, cutoff: Option<DateTime<Utc>>) {
        let ended: Vec<(DeviceId, u32)> = self
            .windows
            .iter()
            .filter(|(_, w)| cutoff.map_or(true, |now| now >= w.closes_at))
            .map(|(k, _)| k.clone())
            .collect();

        for key in ended {
            if let Some(window) = self.windows.remove(&key) {
                self.pending.extend(window.close(key.0, key.1));
            }
        }
    }
}

/// Consumer for observation queues
pub struct TwinConsumer {
    cache: Arc<MetadataCache>,
    store: Arc<dyn ObservationStore>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    batch_size: usize,
    max_buffered: usize,
    batch: Mutex<Batch>,
    counters: Counters,
}

impl TwinConsumer {
    pub fn new(
        cache: Arc<MetadataCache>,
        store: Arc<dyn ObservationStore>,
        batch_size: usize,
        max_buffered: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            cache,
            store,
            channel: RwLock::new(None),
            batch_size,
            max_buffered: max_buffered.max(batch_size),
            batch: Mutex::new(Batch::default()),
            counters: Counters::default(),
        }
    }

    /// Settle subsequent deliveries through `channel`
    pub fn attach(&self, channel: Arc<dyn Channel>) {
        *self.channel.write() = Some(channel);
    }

    pub fn detach(&self) {
        self.channel.write().take();
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Observations waiting to be persisted, excluding open windows
    pub async fn pending(&self) -> usize {
        self.batch.lock().await.pending.len()
    }

    pub fn stats(&self) -> ConsumerStats {
        let c = &self.counters;
        ConsumerStats {
            received: c.received.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            persisted: c.persisted.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            failed_flushes: c.failed_flushes.load(Ordering::Relaxed),
        }
    }

    /// Decode and resolve one delivery into a typed observation
    pub async fn identify(
        &self,
        delivery: &Delivery,
    ) -> Result<(IdentifiedObservation, ObservationSpec), TwinError> {
        let message = ObservationMessage::from_slice(&delivery.body)?;
        let template = self.cache.resolve_template(&message.mid).await?;

        let spec = template
            .observation(message.observation_id)
            .ok_or_else(|| DecodeError::UnknownObservation {
                tid: template.id.clone(),
                observation_id: message.observation_id,
            })?;

        if spec.data_type != message.data_type {
            return Err(DecodeError::TypeMismatch {
                observation_id: message.observation_id,
                declared: message.data_type,
                expected: spec.data_type,
            }
            .into());
        }

        let value = spec.data_type.decode(&message.value)?;
        let timestamp = message
            .timestamp
            .or(delivery.timestamp)
            .unwrap_or_else(Utc::now);

        Ok((
            IdentifiedObservation {
                mid: message.mid,
                observation_id: message.observation_id,
                value,
                timestamp,
            },
            spec.clone(),
        ))
    }

    /// Handle one delivery end to end, settling it with the broker
    pub async fn process(&self, delivery: Delivery) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let (observation, spec) = match self.identify(&delivery).await {
            Ok(identified) => identified,
            Err(TwinError::Resolve(ResolveError::Repository(e))) => {
                // The message may be fine; the broker keeps it for a retry
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    queue = %delivery.queue,
                    error = %e,
                    "Metadata lookup failed, handing delivery back to the broker"
                );
                self.settle(delivery.delivery_tag, Settle::Requeue).await;
                return;
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    queue = %delivery.queue,
                    kind = error_kind(&e),
                    error = %e,
                    "Dropping undeliverable observation"
                );
                self.settle(delivery.delivery_tag, Settle::Drop).await;
                return;
            }
        };

        let mut batch = self.batch.lock().await;
        if batch.pending.len() >= self.max_buffered
            && self.flush_locked(&mut batch, Some(Utc::now())).await.is_err()
        {
            drop(batch);
            self.counters.requeued.fetch_add(1, Ordering::Relaxed);
            warn!(
                delivery_tag = delivery.delivery_tag,
                max_buffered = self.max_buffered,
                "Batch buffer full, handing delivery back to the broker"
            );
            self.settle(delivery.delivery_tag, Settle::Requeue).await;
            return;
        }

        debug!(%observation, "Observation buffered");
        batch.append(observation, &spec);
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        self.settle(delivery.delivery_tag, Settle::Ack).await;

        if batch.pending.len() >= self.batch_size {
            // Failure is logged and the batch retained for the next trigger
            let _ = self.flush_locked(&mut batch, Some(Utc::now())).await;
        }
    }

    /// Persist everything pending, closing windows that have ended
    pub async fn flush(&self) -> Result<usize, TwinError> {
        let mut batch = self.batch.lock().await;
        self.flush_locked(&mut batch, Some(Utc::now())).await
    }

    /// Close every open window, ended or not, and persist everything
    pub async fn drain(&self) -> Result<usize, TwinError> {
        let mut batch = self.batch.lock().await;
        self.flush_locked(&mut batch, None).await
    }

    async fn flush_locked(
        &self,
        batch: &mut Batch,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<usize, TwinError> {
        batch.close_windows(cutoff);
        if batch.pending.is_empty() {
            return Ok(0);
        }

        let count = batch.pending.len();
        let started = Instant::now();
        match self.store.persist(&batch.pending).await {
            Ok(()) => {
                batch.pending.clear();
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .persisted
                    .fetch_add(count as u64, Ordering::Relaxed);
                info!(
                    count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Flushed observation batch"
                );
                Ok(count)
            }
            Err(e) => {
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                error!(
                    count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Flush failed, batch retained"
                );
                Err(TwinError::Persistence(e))
            }
        }
    }

    async fn settle(&self, delivery_tag: u64, settle: Settle) {
        let channel = self.channel.read().clone();
        let Some(channel) = channel else {
            warn!(delivery_tag, ?settle, "No channel attached, delivery left unsettled");
            return;
        };

        let result = match settle {
            Settle::Ack => channel.ack(delivery_tag).await,
            Settle::Drop => channel.reject(delivery_tag, false).await,
            Settle::Requeue => channel.reject(delivery_tag, true).await,
        };
        if let Err(e) = result {
            warn!(delivery_tag, ?settle, error = %e, "Failed to settle delivery");
        }
    }
}

fn error_kind(error: &TwinError) -> &'static str {
    match error {
        TwinError::Resolve(e) => e.kind(),
        TwinError::Decode(e) => e.kind(),
        TwinError::Config(_) => "config",
        TwinError::Broker(_) => "broker",
        TwinError::Persistence(_) => "persistence",
    }
}

#[async_trait]
impl DeliveryHandler for TwinConsumer {
    async fn handle(&self, delivery: Delivery) {
        self.process(delivery).await;
    }
}

/// Applies metadata change notifications to the cache
pub struct NotificationConsumer {
    cache: Arc<MetadataCache>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
}

impl NotificationConsumer {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self {
            cache,
            channel: RwLock::new(None),
        }
    }

    pub fn attach(&self, channel: Arc<dyn Channel>) {
        *self.channel.write() = Some(channel);
    }

    pub fn detach(&self) {
        self.channel.write().take();
    }
}

#[async_trait]
impl DeliveryHandler for NotificationConsumer {
    async fn handle(&self, delivery: Delivery) {
        let ack = match CacheNotification::from_slice(&delivery.body) {
            Ok(notification) => {
                let evicted = self.cache.apply(&notification);
                info!(?notification, evicted, "Applied metadata change");
                true
            }
            Err(e) => {
                warn!(delivery_tag = delivery.delivery_tag, kind = e.kind(), error = %e, "Dropping malformed notification");
                false
            }
        };

        let channel = self.channel.read().clone();
        if let Some(channel) = channel {
            let result = if ack {
                channel.ack(delivery.delivery_tag).await
            } else {
                channel.reject(delivery.delivery_tag, false).await
            };
            if let Err(e) = result {
                warn!(delivery_tag = delivery.delivery_tag, error = %e, "Failed to settle notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceTemplate;
    use crate::value::DataType;

    fn reading(mid: &str, x: f64, at: DateTime<Utc>) -> IdentifiedObservation {
        IdentifiedObservation {
            mid: DeviceId::new(mid),
            observation_id: 7,
            value: ObservationValue::from(x),
            timestamp: at,
        }
    }

    #[test]
    fn test_plain_observations_go_straight_to_pending() {
        let spec = ObservationSpec::new(7, "temperature", DataType::Double);
        let mut batch = Batch::default();
        batch.append(reading("D1", 1.0, Utc::now()), &spec);
        assert_eq!(batch.pending.len(), 1);
        assert!(batch.windows.is_empty());
    }

    #[test]
    fn test_window_closes_on_later_sample() {
        let spec = ObservationSpec::new(7, "temperature", DataType::Double).aggregated(60);
        let t0 = Utc::now();
        let mut batch = Batch::default();

        batch.append(reading("D1", 1.0, t0), &spec);
        batch.append(reading("D1", 3.0, t0 + ChronoDuration::seconds(30)), &spec);
        assert!(batch.pending.is_empty());

        batch.append(reading("D1", 10.0, t0 + ChronoDuration::seconds(61)), &spec);
        assert_eq!(batch.pending.len(), 1);

        let ObservationValue::Statistics(summary) = &batch.pending[0].value else {
            panic!("expected a statistics observation");
        };
        assert_eq!(summary.count, 2);
        assert_eq!(summary.mean.into_inner(), 2.0);
        assert_eq!(batch.pending[0].timestamp, t0);

        // The late sample opened a fresh window
        assert_eq!(batch.windows.len(), 1);
    }

    #[test]
    fn test_close_windows_only_takes_ended_ones() {
        let spec = ObservationSpec::new(7, "temperature", DataType::Double).aggregated(60);
        let t0 = Utc::now();
        let mut batch = Batch::default();
        batch.append(reading("D1", 1.0, t0), &spec);
        batch.append(reading("D2", 1.0, t0 + ChronoDuration::seconds(45)), &spec);

        batch.close_windows(Some(t0 + ChronoDuration::seconds(60)));
        assert_eq!(batch.pending.len(), 1);
        assert_eq!(batch.pending[0].mid, DeviceId::new("D1"));
        assert_eq!(batch.windows.len(), 1);

        batch.close_windows(None);
        assert_eq!(batch.pending.len(), 2);
        assert!(batch.windows.is_empty());
    }

    #[test]
    fn test_non_numeric_values_bypass_aggregation() {
        let spec = ObservationSpec::new(7, "label", DataType::String).aggregated(60);
        let mut batch = Batch::default();
        batch.append(
            IdentifiedObservation {
                mid: DeviceId::new("D1"),
                observation_id: 7,
                value: ObservationValue::from("idle"),
                timestamp: Utc::now(),
            },
            &spec,
        );
        assert_eq!(batch.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_identify_rejects_type_mismatch() {
        let store = crate::storage::MemoryStore::new();
        store.put_device(crate::model::DeviceRecord::new("D1", "T1"));
        store.put_template(
            DeviceTemplate::new("T1", "Meter")
                .with_observation(ObservationSpec::new(5, "count", DataType::Integer)),
        );
        let cache = Arc::new(MetadataCache::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        ));
        let consumer = TwinConsumer::new(cache, Arc::new(store), 1, 10);

        let body = ObservationMessage::new("D1", 5, DataType::String, serde_json::json!("x")).to_vec();
        let delivery = Delivery {
            delivery_tag: 1,
            queue: "q".into(),
            routing_key: "q".into(),
            body,
            redelivered: false,
            timestamp: None,
        };

        let err = consumer.identify(&delivery).await.unwrap_err();
        assert_eq!(error_kind(&err), "type_mismatch");
    }
}

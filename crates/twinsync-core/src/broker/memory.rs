//! In-process broker
//!
//! Queues, topology and users held in memory, speaking the same
//! connection/channel traits as a networked transport. Consumers of the same
//! queue compete for its messages; each is fed by a dedicated task, one
//! delivery at a time, so a slow handler only holds back its own share.

use super::{
    BindingInfo, Channel, Connection, Connector, ConsumerTag, Delivery, DeliveryHandler,
    ExchangeInfo, ManagementApi, QueueInfo, UserInfo,
};
use crate::connection::ConnectionDescriptor;
use crate::error::BrokerError;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct QueuedMessage {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
    published_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueCounters {
    published: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
}

struct QueueState {
    name: String,
    tx: mpsc::UnboundedSender<QueuedMessage>,
    /// Shared by competing consumers; the fair lock hands messages out in turn
    rx: AsyncMutex<mpsc::UnboundedReceiver<QueuedMessage>>,
    ready: AtomicUsize,
    unacked: AtomicUsize,
    consumers: AtomicUsize,
    counters: QueueCounters,
}

impl QueueState {
    fn new(name: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.to_string(),
            tx,
            rx: AsyncMutex::new(rx),
            ready: AtomicUsize::new(0),
            unacked: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
            counters: QueueCounters::default(),
        })
    }

    fn enqueue(&self, message: QueuedMessage) {
        // Count first so a consumer never sees `ready` underflow
        self.ready.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).is_err() {
            self.ready.fetch_sub(1, Ordering::SeqCst);
            warn!(queue = %self.name, "Queue receiver lost, message dropped");
        }
    }
}

struct BrokerState {
    reachable: AtomicBool,
    queues: DashMap<String, Arc<QueueState>>,
    exchanges: DashMap<String, ExchangeInfo>,
    bindings: Mutex<Vec<BindingInfo>>,
    users: DashMap<String, UserInfo>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    connects: AtomicU64,
}

/// In-memory broker; cheap to clone, all clones share state
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                reachable: AtomicBool::new(true),
                queues: DashMap::new(),
                exchanges: DashMap::new(),
                bindings: Mutex::new(Vec::new()),
                users: DashMap::new(),
                connections: Mutex::new(Vec::new()),
                connects: AtomicU64::new(0),
            }),
        }
    }

    /// Declare a queue; declaring an existing queue is a no-op
    pub fn declare_queue(&self, name: &str) {
        self.state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState::new(name));
    }

    pub fn declare_exchange(&self, name: &str) {
        self.state.exchanges.insert(
            name.to_string(),
            ExchangeInfo {
                name: name.to_string(),
                vhost: "/".to_string(),
            },
        );
    }

    pub fn bind(&self, binding: BindingInfo) {
        let mut bindings = self.state.bindings.lock();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
    }

    pub fn add_user(&self, user: UserInfo) {
        self.state.users.insert(user.name.clone(), user);
    }

    /// Publish straight to a queue through the default exchange
    pub fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        let state = self
            .queue(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        state.counters.published.fetch_add(1, Ordering::SeqCst);
        state.enqueue(QueuedMessage {
            routing_key: queue.to_string(),
            body: body.into(),
            redelivered: false,
            published_at: Utc::now(),
        });
        Ok(())
    }

    /// Refuse (or allow again) new connections and management calls
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Close every live client connection from the broker side
    pub async fn sever_connections(&self) {
        let live: Vec<Arc<MemoryConnection>> = {
            let mut connections = self.state.connections.lock();
            connections.retain(|c| c.strong_count() > 0);
            connections.iter().filter_map(Weak::upgrade).collect()
        };

        debug!(count = live.len(), "Severing client connections");
        for connection in live {
            connection.shutdown().await;
        }
    }

    pub fn connection_attempts(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_open())
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.counter(queue, |q| q.consumers.load(Ordering::SeqCst))
    }

    /// Messages waiting to be delivered
    pub fn ready(&self, queue: &str) -> usize {
        self.counter(queue, |q| q.ready.load(Ordering::SeqCst))
    }

    /// Messages delivered but not yet acked or rejected
    pub fn unacked(&self, queue: &str) -> usize {
        self.counter(queue, |q| q.unacked.load(Ordering::SeqCst))
    }

    pub fn published(&self, queue: &str) -> u64 {
        self.counter(queue, |q| q.counters.published.load(Ordering::SeqCst))
    }

    pub fn acked(&self, queue: &str) -> u64 {
        self.counter(queue, |q| q.counters.acked.load(Ordering::SeqCst))
    }

    /// Deliveries rejected without requeue
    pub fn rejected(&self, queue: &str) -> u64 {
        self.counter(queue, |q| q.counters.rejected.load(Ordering::SeqCst))
    }

    pub fn requeued(&self, queue: &str) -> u64 {
        self.counter(queue, |q| q.counters.requeued.load(Ordering::SeqCst))
    }

    fn queue(&self, name: &str) -> Option<Arc<QueueState>> {
        self.state.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    fn counter<T: Default>(&self, queue: &str, read: impl Fn(&QueueState) -> T) -> T {
        self.queue(queue).map(|q| read(&q)).unwrap_or_default()
    }

    fn ensure_reachable(&self) -> anyhow::Result<()> {
        if self.state.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("management interface unreachable"))
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn Connection>, BrokerError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable(format!(
                "{}:{}",
                descriptor.host, descriptor.port
            )));
        }

        let connection = Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            open: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
        });
        self.state
            .connections
            .lock()
            .push(Arc::downgrade(&connection));

        debug!(host = %descriptor.host, vhost = %descriptor.virtual_host, "Memory broker connection opened");
        Ok(connection)
    }
}

pub struct MemoryConnection {
    state: Arc<BrokerState>,
    open: AtomicBool,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    async fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            channel.shutdown().await;
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Closed);
        }

        let channel = Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(0),
            consumers: Mutex::new(HashMap::new()),
            unacked: Arc::new(Mutex::new(HashMap::new())),
            next_delivery_tag: Arc::new(AtomicU64::new(0)),
            next_consumer: AtomicU64::new(0),
        });
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown().await;
        Ok(())
    }
}

struct Unacked {
    consumer: String,
    queue: Arc<QueueState>,
    message: QueuedMessage,
    permits: Option<Arc<Semaphore>>,
}

struct ConsumerEntry {
    queue: Arc<QueueState>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

type UnackedMap = Arc<Mutex<HashMap<u64, Unacked>>>;

pub struct MemoryChannel {
    state: Arc<BrokerState>,
    open: AtomicBool,
    prefetch: AtomicU16,
    consumers: Mutex<HashMap<String, ConsumerEntry>>,
    unacked: UnackedMap,
    next_delivery_tag: Arc<AtomicU64>,
    next_consumer: AtomicU64,
}

impl MemoryChannel {
    async fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let tags: Vec<String> = self.consumers.lock().keys().cloned().collect();
        for tag in tags {
            self.cancel_consumer(&tag).await;
        }

        // Anything still outstanding goes back to its queue
        let leftovers: Vec<Unacked> = self.unacked.lock().drain().map(|(_, u)| u).collect();
        for entry in leftovers {
            release(&entry);
            requeue(entry);
        }
    }

    async fn cancel_consumer(&self, tag: &str) {
        let Some(entry) = self.consumers.lock().remove(tag) else {
            return;
        };

        // The task may already have exited on its own
        let _ = entry.stop.send(());
        if let Err(e) = entry.task.await {
            warn!(consumer = tag, queue = %entry.queue.name, error = %e, "Consumer task failed");
        }
        entry.queue.consumers.fetch_sub(1, Ordering::SeqCst);

        let orphaned: Vec<Unacked> = {
            let mut unacked = self.unacked.lock();
            let tags: Vec<u64> = unacked
                .iter()
                .filter(|(_, u)| u.consumer == tag)
                .map(|(t, _)| *t)
                .collect();
            tags.into_iter().filter_map(|t| unacked.remove(&t)).collect()
        };
        debug!(consumer = tag, requeued = orphaned.len(), "Consumer cancelled");
        for entry in orphaned {
            release(&entry);
            requeue(entry);
        }
    }

    fn settle(&self, delivery_tag: u64) -> Result<Unacked, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Closed);
        }
        let entry = self
            .unacked
            .lock()
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        release(&entry);
        Ok(entry)
    }
}

fn release(entry: &Unacked) {
    entry.queue.unacked.fetch_sub(1, Ordering::SeqCst);
    if let Some(permits) = &entry.permits {
        permits.add_permits(1);
    }
}

fn requeue(entry: Unacked) {
    entry.queue.counters.requeued.fetch_add(1, Ordering::SeqCst);
    entry.queue.enqueue(QueuedMessage {
        redelivered: true,
        ..entry.message
    });
}

struct ConsumeLoop {
    consumer: String,
    queue: Arc<QueueState>,
    handler: Arc<dyn DeliveryHandler>,
    unacked: UnackedMap,
    next_delivery_tag: Arc<AtomicU64>,
    permits: Option<Arc<Semaphore>>,
}

impl ConsumeLoop {
    async fn run(self, mut stop: oneshot::Receiver<()>) {
        loop {
            if let Some(permits) = &self.permits {
                tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    permit = permits.acquire() => match permit {
                        Ok(p) => p.forget(),
                        Err(_) => break,
                    },
                }
            }

            let message = tokio::select! {
                biased;
                _ = &mut stop => {
                    if let Some(permits) = &self.permits {
                        permits.add_permits(1);
                    }
                    break;
                }
                next = async { self.queue.rx.lock().await.recv().await } => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            self.queue.ready.fetch_sub(1, Ordering::SeqCst);
            self.queue.unacked.fetch_add(1, Ordering::SeqCst);

            let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = Delivery {
                delivery_tag,
                queue: self.queue.name.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
                timestamp: Some(message.published_at),
            };
            self.unacked.lock().insert(
                delivery_tag,
                Unacked {
                    consumer: self.consumer.clone(),
                    queue: Arc::clone(&self.queue),
                    message,
                    permits: self.permits.clone(),
                },
            );

            self.handler.handle(delivery).await;
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn basic_qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Closed);
        }
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerTag, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Closed);
        }

        let state = self
            .state
            .queues
            .get(queue)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let n = self.next_consumer.fetch_add(1, Ordering::SeqCst) + 1;
        let tag = format!("ctag-{}-{n}", uuid::Uuid::new_v4().simple());
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let permits = (prefetch > 0).then(|| Arc::new(Semaphore::new(prefetch as usize)));

        let (stop_tx, stop_rx) = oneshot::channel();
        let consume = ConsumeLoop {
            consumer: tag.clone(),
            queue: Arc::clone(&state),
            handler,
            unacked: Arc::clone(&self.unacked),
            next_delivery_tag: Arc::clone(&self.next_delivery_tag),
            permits,
        };
        let task = tokio::spawn(consume.run(stop_rx));

        state.consumers.fetch_add(1, Ordering::SeqCst);
        self.consumers.lock().insert(
            tag.clone(),
            ConsumerEntry {
                queue: state,
                stop: stop_tx,
                task,
            },
        );

        debug!(consumer = %tag, queue, prefetch, "Consumer registered");
        Ok(ConsumerTag(tag))
    }

    async fn basic_cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError> {
        self.cancel_consumer(&tag.0).await;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let entry = self.settle(delivery_tag)?;
        entry.queue.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue_message: bool) -> Result<(), BrokerError> {
        let entry = self.settle(delivery_tag)?;
        if requeue_message {
            requeue(entry);
        } else {
            entry.queue.counters.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl ManagementApi for MemoryBroker {
    async fn list_exchanges(&self) -> anyhow::Result<Vec<ExchangeInfo>> {
        self.ensure_reachable()?;
        Ok(self.state.exchanges.iter().map(|e| e.value().clone()).collect())
    }

    async fn list_queues(&self) -> anyhow::Result<Vec<QueueInfo>> {
        self.ensure_reachable()?;
        Ok(self
            .state
            .queues
            .iter()
            .map(|q| QueueInfo {
                name: q.key().clone(),
                consumers: q.consumers.load(Ordering::SeqCst) as u32,
            })
            .collect())
    }

    async fn list_bindings(&self) -> anyhow::Result<Vec<BindingInfo>> {
        self.ensure_reachable()?;
        Ok(self.state.bindings.lock().clone())
    }

    async fn list_users(&self) -> anyhow::Result<Vec<UserInfo>> {
        self.ensure_reachable()?;
        Ok(self.state.users.iter().map(|u| u.value().clone()).collect())
    }

    async fn delete_exchange(&self, name: &str) -> anyhow::Result<()> {
        self.ensure_reachable()?;
        self.state
            .exchanges
            .remove(name)
            .ok_or_else(|| anyhow!("exchange '{name}' not found"))?;
        self.state.bindings.lock().retain(|b| !b.touches(name));
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> anyhow::Result<()> {
        self.ensure_reachable()?;
        self.state
            .queues
            .remove(name)
            .ok_or_else(|| anyhow!("queue '{name}' not found"))?;
        self.state.bindings.lock().retain(|b| b.destination != name);
        Ok(())
    }

    async fn delete_user(&self, name: &str) -> anyhow::Result<()> {
        self.ensure_reachable()?;
        self.state
            .users
            .remove(name)
            .ok_or_else(|| anyhow!("user '{name}' not found"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    struct Forward(UnboundedSender<Delivery>);

    #[async_trait]
    impl DeliveryHandler for Forward {
        async fn handle(&self, delivery: Delivery) {
            let _ = self.0.send(delivery);
        }
    }

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::parse("localhost,guest,guest,false").unwrap()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn test_deliver_and_ack() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        let connection = broker.connect(&descriptor()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.basic_consume("q", Arc::new(Forward(tx))).await.unwrap();
        broker.publish("q", b"hello".to_vec()).unwrap();

        let delivery = next(&mut rx).await;
        assert_eq!(delivery.body, b"hello");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked("q"), 1);

        channel.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.acked("q"), 1);
        assert_eq!(broker.unacked("q"), 0);
        assert!(matches!(
            channel.ack(delivery.delivery_tag).await,
            Err(BrokerError::UnknownDeliveryTag(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_requeues_unacked() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        let connection = broker.connect(&descriptor()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = channel.basic_consume("q", Arc::new(Forward(tx))).await.unwrap();
        broker.publish("q", b"one".to_vec()).unwrap();
        next(&mut rx).await;

        channel.basic_cancel(&tag).await.unwrap();
        assert_eq!(broker.consumer_count("q"), 0);
        assert_eq!(broker.ready("q"), 1);

        // A new consumer gets the message again, flagged as redelivered
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.basic_consume("q", Arc::new(Forward(tx))).await.unwrap();
        assert!(next(&mut rx).await.redelivered);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_in_flight() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        let connection = broker.connect(&descriptor()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.basic_qos(1).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.basic_consume("q", Arc::new(Forward(tx))).await.unwrap();
        broker.publish("q", b"a".to_vec()).unwrap();
        broker.publish("q", b"b".to_vec()).unwrap();

        let first = next(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        channel.ack(first.delivery_tag).await.unwrap();
        assert_eq!(next(&mut rx).await.body, b"b");
    }

    #[tokio::test]
    async fn test_consumers_compete_for_one_queue() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        let connection = broker.connect(&descriptor()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.basic_qos(1).await.unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        channel.basic_consume("q", Arc::new(Forward(tx_a))).await.unwrap();
        channel.basic_consume("q", Arc::new(Forward(tx_b))).await.unwrap();
        assert_eq!(broker.consumer_count("q"), 2);

        broker.publish("q", b"a".to_vec()).unwrap();
        broker.publish("q", b"b".to_vec()).unwrap();

        // Prefetch 1 each: both consumers hold one message
        let first = next(&mut rx_a).await;
        let second = next(&mut rx_b).await;
        assert_ne!(first.body, second.body);
        assert_eq!(broker.unacked("q"), 2);
    }

    #[tokio::test]
    async fn test_unreachable_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        assert!(matches!(
            broker.connect(&descriptor()).await,
            Err(BrokerError::Unreachable(_))
        ));
        assert!(broker.list_exchanges().await.is_err());
    }

    #[tokio::test]
    async fn test_sever_closes_connections() {
        let broker = MemoryBroker::new();
        let connection = broker.connect(&descriptor()).await.unwrap();
        assert_eq!(broker.open_connections(), 1);

        broker.sever_connections().await;
        assert!(!connection.is_open());
        assert_eq!(broker.open_connections(), 0);
        // Client-side close after a broker-side close is harmless
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_exchange_drops_its_bindings() {
        let broker = MemoryBroker::new();
        broker.declare_exchange("x");
        broker.declare_queue("q");
        broker.bind(BindingInfo::to_queue("x", "q", "#"));

        broker.delete_exchange("x").await.unwrap();
        assert!(broker.list_bindings().await.unwrap().is_empty());
        assert!(broker.delete_exchange("x").await.is_err());
    }
}

//! MQTT transport for RabbitMQ's MQTT plugin
//!
//! A "queue" passed to [`Channel::basic_consume`] is an MQTT topic filter;
//! the plugin backs each subscription with a queue of its own. Sessions are
//! persistent and acks are manual, so a publish that is never acked comes
//! back after the next reconnect. `reject(tag, true)` relies on exactly that
//! and marks the session stale, so the owner sees a closed connection and
//! reconnects; `reject(tag, false)` acks the publish to drop it.

use super::{Channel, Connection, Connector, ConsumerTag, Delivery, DeliveryHandler};
use crate::connection::{ConnectionDescriptor, DEFAULT_VHOST};
use crate::error::BrokerError;
use crate::naming::topic_to_routing_key;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, Publish, QoS, Transport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Opens MQTT sessions against the broker named by a connection descriptor
#[derive(Debug, Clone)]
pub struct MqttConnector {
    client_id: String,
    port: Option<u16>,
    connect_timeout: Duration,
}

impl MqttConnector {
    /// `client_id` must be stable across restarts for the session to persist
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            port: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Use this port instead of the descriptor's AMQP port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    fn options(&self, descriptor: &ConnectionDescriptor) -> MqttOptions {
        let port = self.port.unwrap_or(descriptor.port);
        let mut options = MqttOptions::new(self.client_id.clone(), descriptor.host.clone(), port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(false);
        options.set_manual_acks(true);

        options.set_credentials(login(descriptor), descriptor.password.clone());

        if descriptor.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

/// The plugin selects a vhost through a "vhost:user" login
fn login(descriptor: &ConnectionDescriptor) -> String {
    if descriptor.virtual_host == DEFAULT_VHOST {
        descriptor.user.clone()
    } else {
        format!("{}:{}", descriptor.virtual_host, descriptor.user)
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(BrokerError::Unreachable(format!("connection refused: {code:?}"))),
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(BrokerError::Unreachable(e.to_string())),
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn Connection>, BrokerError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(descriptor), REQUEST_CAPACITY);

        tokio::time::timeout(self.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| BrokerError::Unreachable(format!("{descriptor}: connect timed out")))??;
        info!(broker = %descriptor, client_id = %self.client_id, "MQTT session established");

        let shared = Arc::new(Session::new(client));

        let (stop_tx, stop_rx) = oneshot::channel();
        let pump = tokio::spawn(pump(eventloop, Arc::clone(&shared), stop_rx));

        Ok(Arc::new(MqttConnection {
            session: shared,
            stop: Mutex::new(Some(stop_tx)),
            pump: Mutex::new(Some(pump)),
        }))
    }
}

struct Route {
    filter: String,
    consumer: String,
    tx: mpsc::UnboundedSender<Publish>,
}

struct Session {
    client: AsyncClient,
    open: AtomicBool,
    /// A publish was handed back; only a new session redelivers it
    stale: AtomicBool,
    routes: Mutex<Vec<Route>>,
    pending: DashMap<u64, (String, Publish)>,
    next_delivery_tag: AtomicU64,
}

impl Session {
    fn new(client: AsyncClient) -> Self {
        Self {
            client,
            open: AtomicBool::new(true),
            stale: AtomicBool::new(false),
            routes: Mutex::new(Vec::new()),
            pending: DashMap::new(),
            next_delivery_tag: AtomicU64::new(0),
        }
    }

    fn is_live(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.stale.load(Ordering::SeqCst)
    }

    fn route(&self, publish: Publish) {
        let routes = self.routes.lock();
        match routes.iter().find(|r| topic_matches(&r.filter, &publish.topic)) {
            Some(route) => {
                if route.tx.send(publish).is_err() {
                    debug!(consumer = %route.consumer, "Consumer gone, publish left unacked");
                }
            }
            None => debug!(topic = %publish.topic, "No consumer for topic"),
        }
    }
}

/// Drive the event loop until it fails or the connection is closed
async fn pump(mut eventloop: EventLoop, session: Arc<Session>, mut stop: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => session.route(publish),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT event loop stopped");
                    break;
                }
            },
        }
    }
    session.open.store(false, Ordering::SeqCst);
}

pub struct MqttConnection {
    session: Arc<Session>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Connection for MqttConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Closed);
        }
        Ok(Arc::new(MqttChannel {
            session: Arc::clone(&self.session),
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(0),
            consumers: Mutex::new(HashMap::new()),
        }))
    }

    fn is_open(&self) -> bool {
        self.session.is_live()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let stop = self.stop.lock().take();
        let Some(stop) = stop else {
            return Ok(());
        };

        if self.session.open.load(Ordering::SeqCst) {
            if let Err(e) = self.session.client.disconnect().await {
                debug!(error = %e, "MQTT disconnect request failed");
            }
        }
        let _ = stop.send(());

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!(error = %e, "MQTT event loop task failed");
            }
        }
        self.session.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct Subscription {
    filter: String,
    permits: Option<Arc<Semaphore>>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct MqttChannel {
    session: Arc<Session>,
    open: AtomicBool,
    prefetch: AtomicU16,
    consumers: Mutex<HashMap<String, Subscription>>,
}

struct Dispatch {
    consumer: String,
    session: Arc<Session>,
    handler: Arc<dyn DeliveryHandler>,
    permits: Option<Arc<Semaphore>>,
}

impl Dispatch {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Publish>, mut stop: oneshot::Receiver<()>) {
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

            let publish = tokio::select! {
                biased;
                _ = &mut stop => break,
                next = rx.recv() => match next {
                    Some(publish) => publish,
                    None => break,
                },
            };

            let delivery_tag = self.session.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = Delivery {
                delivery_tag,
                queue: publish.topic.clone(),
                routing_key: topic_to_routing_key(&publish.topic),
                body: publish.payload.to_vec(),
                redelivered: publish.dup,
                timestamp: None,
            };
            self.session
                .pending
                .insert(delivery_tag, (self.consumer.clone(), publish));

            self.handler.handle(delivery).await;
        }
    }
}

impl MqttChannel {
    fn settle(&self, delivery_tag: u64) -> Result<Publish, BrokerError> {
        // A stale session still settles what it delivered
        if !self.open.load(Ordering::SeqCst) || !self.session.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let (consumer, publish) = self
            .session
            .pending
            .remove(&delivery_tag)
            .map(|(_, entry)| entry)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;

        let permits = self
            .consumers
            .lock()
            .get(&consumer)
            .and_then(|s| s.permits.clone());
        if let Some(permits) = permits {
            permits.add_permits(1);
        }
        Ok(publish)
    }

    async fn cancel_consumer(&self, tag: &str) {
        let Some(subscription) = self.consumers.lock().remove(tag) else {
            return;
        };

        self.session.routes.lock().retain(|r| r.consumer != tag);
        if self.session.open.load(Ordering::SeqCst) {
            if let Err(e) = self.session.client.unsubscribe(subscription.filter.clone()).await {
                debug!(consumer = tag, error = %e, "Unsubscribe failed");
            }
        }

        let _ = subscription.stop.send(());
        if let Err(e) = subscription.task.await {
            warn!(consumer = tag, error = %e, "Dispatch task failed");
        }

        // Unacked publishes come back with the next session
        self.session.pending.retain(|_, (consumer, _)| consumer != tag);
        debug!(consumer = tag, filter = %subscription.filter, "Consumer cancelled");
    }
}

#[async_trait]
impl Channel for MqttChannel {
    /// MQTT 3.1.1 has no prefetch; the limit is enforced on the client side
    async fn basic_qos(&self, prefetch: u16) -> Result<(), BrokerError> {
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

        let tag = format!("mqtt-{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = mpsc::unbounded_channel();
        self.session.routes.lock().push(Route {
            filter: queue.to_string(),
            consumer: tag.clone(),
            tx,
        });

        if let Err(e) = self
            .session
            .client
            .subscribe(queue.to_string(), QoS::AtLeastOnce)
            .await
        {
            self.session.routes.lock().retain(|r| r.consumer != tag);
            return Err(BrokerError::Protocol(format!("subscribe to '{queue}' failed: {e}")));
        }

        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let permits = (prefetch > 0).then(|| Arc::new(Semaphore::new(prefetch as usize)));
        let (stop_tx, stop_rx) = oneshot::channel();
        let dispatch = Dispatch {
            consumer: tag.clone(),
            session: Arc::clone(&self.session),
            handler,
            permits: permits.clone(),
        };
        let task = tokio::spawn(dispatch.run(rx, stop_rx));

        self.consumers.lock().insert(
            tag.clone(),
            Subscription {
                filter: queue.to_string(),
                permits,
                stop: stop_tx,
                task,
            },
        );
        debug!(consumer = %tag, filter = queue, prefetch, "Subscribed");
        Ok(ConsumerTag(tag))
    }

    async fn basic_cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError> {
        self.cancel_consumer(&tag.0).await;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let publish = self.settle(delivery_tag)?;
        self.session
            .client
            .ack(&publish)
            .await
            .map_err(|e| BrokerError::Protocol(format!("ack failed: {e}")))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let publish = self.settle(delivery_tag)?;
        if requeue {
            // Left unacked; the broker redelivers it on the next session
            if !self.session.stale.swap(true, Ordering::SeqCst) {
                info!(delivery_tag, "Publish handed back, session needs a reconnect");
            }
            return Ok(());
        }
        self.session
            .client
            .ack(&publish)
            .await
            .map_err(|e| BrokerError::Protocol(format!("ack failed: {e}")))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.session.is_live()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let tags: Vec<String> = self.consumers.lock().keys().cloned().collect();
        for tag in tags {
            self.cancel_consumer(&tag).await;
        }
        Ok(())
    }
}

/// MQTT topic filter match with `+` (one level) and `#` (remaining levels)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

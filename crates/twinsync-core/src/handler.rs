//! Connection lifecycle for one consumer instance
//!
//! A [`TwinHandler`] is driven by an external poll loop calling [`TwinHandler::run`].
//! Each call advances a small state machine:
//!
//! - `Disconnected`: tear down leftovers, connect, open a channel, set the
//!   prefetch limit and register consumers. On failure wait out the cooldown
//!   and stay `Disconnected`.
//! - `Running`: force a flush once the time-in-buffer deadline has passed
//!   (only when batching), and drop back to `Disconnected` if the broker
//!   closed the connection.
//!
//! [`TwinHandler::dispose`] releases everything exactly once.

use crate::broker::{Channel, Connection, Connector, ConsumerTag, DeliveryHandler};
use crate::cache::MetadataCache;
use crate::connection::ConnectionDescriptor;
use crate::consumer::{NotificationConsumer, TwinConsumer};
use crate::error::{BrokerError, ConfigError, TwinError};
use crate::storage::ObservationStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Consumer implementations a handler can host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumerKind {
    Observation,
}

impl FromStr for ConsumerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observation" => Ok(ConsumerKind::Observation),
            _ => Err(ConfigError::UnknownConsumerType(s.to_string())),
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerKind::Observation => f.write_str("Observation"),
        }
    }
}

/// Consumer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Discriminator for the consumer implementation, e.g. `"Observation"`
    pub consumer_type: String,
    pub queue: String,
    /// Upper bound on unacknowledged deliveries
    pub prefetch: u16,
    /// 1 disables the time-based flush
    pub batch_size: usize,
    /// Parallel handler instances; used by the host, not the handler
    pub threads: usize,
    pub max_time_in_buffer_secs: u64,
    /// Buffer level at which deliveries are handed back while flushes fail
    pub max_buffered: usize,
    /// Queue carrying metadata change notifications
    pub notification_queue: Option<String>,
    pub reconnect_cooldown_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_type: ConsumerKind::Observation.to_string(),
            queue: "twin.observations".to_string(),
            prefetch: 100,
            batch_size: 50,
            threads: 1,
            max_time_in_buffer_secs: 5,
            max_buffered: 5_000,
            notification_queue: None,
            reconnect_cooldown_secs: 5,
        }
    }
}

impl ConsumerConfig {
    pub fn max_time_in_buffer(&self) -> Duration {
        Duration::from_secs(self.max_time_in_buffer_secs)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_secs(self.reconnect_cooldown_secs)
    }

    /// Check the settings and resolve the consumer kind
    pub fn validate(&self) -> Result<ConsumerKind, ConfigError> {
        let kind = self.consumer_type.parse()?;

        if self.queue.trim().is_empty() {
            return Err(ConfigError::InvalidSetting("queue must not be empty".into()));
        }
        if self.prefetch == 0 {
            return Err(ConfigError::InvalidSetting("prefetch must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidSetting("batch_size must be positive".into()));
        }
        if self.threads == 0 {
            return Err(ConfigError::InvalidSetting("threads must be positive".into()));
        }
        if self.batch_size > 1 && self.max_time_in_buffer_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "max_time_in_buffer_secs must be positive when batching".into(),
            ));
        }
        if self.max_buffered < self.batch_size {
            return Err(ConfigError::InvalidSetting(format!(
                "max_buffered ({}) must be at least batch_size ({})",
                self.max_buffered, self.batch_size
            )));
        }
        Ok(kind)
    }
}

/// Wait applied after a failed connection attempt
pub trait CooldownPolicy: Send + Sync {
    fn next_cooldown(&mut self) -> Duration;

    /// Called once a connection succeeds
    fn reset(&mut self) {}
}

/// The same wait after every failure
#[derive(Debug, Clone, Copy)]
pub struct FixedCooldown(pub Duration);

impl CooldownPolicy for FixedCooldown {
    fn next_cooldown(&mut self) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Disconnected,
    Connecting,
    Running,
}

/// Live broker objects for one connection
struct Session {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    tags: Vec<ConsumerTag>,
}

impl Session {
    async fn close(self) {
        for tag in &self.tags {
            if let Err(e) = self.channel.basic_cancel(tag).await {
                debug!(consumer = %tag, error = %e, "Cancel failed");
            }
        }
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close().await {
            debug!(error = %e, "Connection close failed");
        }
    }
}

/// Orchestrates the broker connection and the consumers hosted on it
pub struct TwinHandler {
    name: String,
    descriptor: ConnectionDescriptor,
    config: ConsumerConfig,
    kind: ConsumerKind,
    connector: Arc<dyn Connector>,
    consumer: Arc<TwinConsumer>,
    notifications: Option<Arc<NotificationConsumer>>,
    cooldown: Box<dyn CooldownPolicy>,
    state: HandlerState,
    session: Option<Session>,
    flush_deadline: Instant,
    disposed: bool,
}

impl TwinHandler {
    /// Build a handler; an invalid configuration is rejected here, never retried
    pub fn new(
        name: impl Into<String>,
        descriptor: ConnectionDescriptor,
        config: ConsumerConfig,
        connector: Arc<dyn Connector>,
        cache: Arc<MetadataCache>,
        store: Arc<dyn ObservationStore>,
    ) -> Result<Self, ConfigError> {
        let kind = config.validate()?;

        let consumer = match kind {
            ConsumerKind::Observation => Arc::new(TwinConsumer::new(
                Arc::clone(&cache),
                store,
                config.batch_size,
                config.max_buffered,
            )),
        };
        let notifications = config
            .notification_queue
            .as_ref()
            .map(|_| Arc::new(NotificationConsumer::new(cache)));

        Ok(Self {
            name: name.into(),
            descriptor,
            cooldown: Box::new(FixedCooldown(config.reconnect_cooldown())),
            flush_deadline: Instant::now() + config.max_time_in_buffer(),
            config,
            kind,
            connector,
            consumer,
            notifications,
            state: HandlerState::Disconnected,
            session: None,
            disposed: false,
        })
    }

    /// Replace the fixed reconnect cooldown
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Box<dyn CooldownPolicy>) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn kind(&self) -> ConsumerKind {
        self.kind
    }

    pub fn consumer(&self) -> &Arc<TwinConsumer> {
        &self.consumer
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Advance the state machine by one step
    pub async fn run(&mut self) -> Result<(), TwinError> {
        if self.disposed {
            return Err(BrokerError::Closed.into());
        }

        match self.state {
            HandlerState::Running => {
                if !self.session_alive() {
                    warn!(handler = %self.name, "Broker connection lost");
                    self.teardown().await;
                    return Ok(());
                }
                self.enforce_flush_deadline().await;
                Ok(())
            }
            HandlerState::Disconnected | HandlerState::Connecting => {
                self.connect().await;
                Ok(())
            }
        }
    }

    fn session_alive(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.connection.is_open() && s.channel.is_open())
    }

    async fn connect(&mut self) {
        self.teardown().await;
        self.state = HandlerState::Connecting;
        debug!(handler = %self.name, broker = %self.descriptor, "Connecting");

        match self.open_session().await {
            Ok(session) => {
                info!(
                    handler = %self.name,
                    broker = %self.descriptor,
                    queue = %self.config.queue,
                    kind = %self.kind,
                    prefetch = self.config.prefetch,
                    "Consumer running"
                );
                self.session = Some(session);
                self.state = HandlerState::Running;
                self.flush_deadline = Instant::now() + self.config.max_time_in_buffer();
                self.cooldown.reset();
            }
            Err(e) => {
                let cooldown = self.cooldown.next_cooldown();
                warn!(
                    handler = %self.name,
                    broker = %self.descriptor,
                    error = %e,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Broker unavailable, retrying after cooldown"
                );
                self.state = HandlerState::Disconnected;
                tokio::time::sleep(cooldown).await;
            }
        }
    }

    async fn open_session(&self) -> Result<Session, BrokerError> {
        let connection = self.connector.connect(&self.descriptor).await?;

        match self.register(&connection).await {
            Ok((channel, tags)) => Ok(Session {
                connection,
                channel,
                tags,
            }),
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Closing half-open connection failed");
                }
                Err(e)
            }
        }
    }

    async fn register(
        &self,
        connection: &Arc<dyn Connection>,
    ) -> Result<(Arc<dyn Channel>, Vec<ConsumerTag>), BrokerError> {
        let channel = connection.create_channel().await?;
        channel.basic_qos(self.config.prefetch).await?;

        self.consumer.attach(Arc::clone(&channel));
        let handler: Arc<dyn DeliveryHandler> = self.consumer.clone();
        let mut tags = vec![channel.basic_consume(&self.config.queue, handler).await?];

        if let (Some(queue), Some(notifications)) =
            (&self.config.notification_queue, &self.notifications)
        {
            notifications.attach(Arc::clone(&channel));
            let handler: Arc<dyn DeliveryHandler> = notifications.clone();
            match channel.basic_consume(queue, handler).await {
                Ok(tag) => tags.push(tag),
                Err(e) => {
                    for tag in &tags {
                        let _ = channel.basic_cancel(tag).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok((channel, tags))
    }

    async fn enforce_flush_deadline(&mut self) {
        if self.config.batch_size <= 1 || Instant::now() < self.flush_deadline {
            return;
        }

        debug!(handler = %self.name, "Flush deadline reached");
        // A failed flush is logged by the consumer and retried next time
        let _ = self.consumer.flush().await;
        self.flush_deadline = Instant::now() + self.config.max_time_in_buffer();
    }

    /// Release broker objects; safe to call with nothing to release
    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            if let Err(e) = self.consumer.flush().await {
                warn!(handler = %self.name, error = %e, "Flush on teardown failed");
            }
        }
        self.consumer.detach();
        if let Some(notifications) = &self.notifications {
            notifications.detach();
        }
        self.state = HandlerState::Disconnected;
    }

    /// Cancel consumers, close channel and connection, persist what is buffered.
    /// Calling it again is a no-op.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        self.teardown().await;
        if let Err(e) = self.consumer.drain().await {
            warn!(handler = %self.name, error = %e, "Buffered observations were not persisted");
        }
        info!(handler = %self.name, stats = ?self.consumer.stats(), "Handler disposed");
    }
}

impl Drop for TwinHandler {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        let Some(session) = self.session.take() else {
            return;
        };

        // Best effort: only possible from within a runtime
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let consumer = Arc::clone(&self.consumer);
                runtime.spawn(async move {
                    session.close().await;
                    let _ = consumer.drain().await;
                    consumer.detach();
                });
            }
            Err(_) => warn!(handler = %self.name, "Handler dropped outside a runtime; broker session leaked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_kind_parsing() {
        assert_eq!("Observation".parse::<ConsumerKind>().unwrap(), ConsumerKind::Observation);
        assert_eq!(" observation ".parse::<ConsumerKind>().unwrap(), ConsumerKind::Observation);
        assert!(matches!(
            "Setting".parse::<ConsumerKind>(),
            Err(ConfigError::UnknownConsumerType(_))
        ));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(ConsumerConfig::default().validate().unwrap(), ConsumerKind::Observation);
    }

    #[test]
    fn test_validation_rejects_nonsense() {
        let zero_prefetch = ConsumerConfig {
            prefetch: 0,
            ..ConsumerConfig::default()
        };
        assert!(zero_prefetch.validate().is_err());

        let tiny_buffer = ConsumerConfig {
            batch_size: 10,
            max_buffered: 5,
            ..ConsumerConfig::default()
        };
        assert!(tiny_buffer.validate().is_err());

        // No deadline needed when every message flushes immediately
        let unbatched = ConsumerConfig {
            batch_size: 1,
            max_time_in_buffer_secs: 0,
            ..ConsumerConfig::default()
        };
        assert!(unbatched.validate().is_ok());
    }

    #[test]
    fn test_config_from_json_fills_defaults() {
        let config: ConsumerConfig =
            serde_json::from_str(r#"{"queue":"obs","batch_size":3}"#).unwrap();
        assert_eq!(config.queue, "obs");
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.prefetch, ConsumerConfig::default().prefetch);
    }
}

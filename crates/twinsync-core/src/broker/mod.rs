//! Broker client abstraction
//!
//! Shaped after AMQP 0-9-1: a [`Connector`] opens a [`Connection`], which
//! opens [`Channel`]s; a channel sets a prefetch limit, registers consumers
//! and acknowledges deliveries. The client delivers messages to a consumer on
//! its own task, one at a time per consumer.

pub mod management;
pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use management::{BindingInfo, ExchangeInfo, ManagementApi, QueueInfo, UserInfo};
pub use memory::MemoryBroker;

use crate::connection::ConnectionDescriptor;
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// One message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or reject
    pub delivery_tag: u64,
    pub queue: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
    /// Broker-side publish time, when the transport carries one
    pub timestamp: Option<DateTime<Utc>>,
}

/// Server-assigned identity of a registered consumer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(pub String);

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callback invoked for every delivery on a subscription
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// Opens broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn Connection>, BrokerError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    fn is_open(&self) -> bool;

    /// Close the connection; closing twice is a no-op
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Bound the number of unacknowledged deliveries per consumer
    async fn basic_qos(&self, prefetch: u16) -> Result<(), BrokerError>;

    async fn basic_consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerTag, BrokerError>;

    /// Stop a consumer; its unacknowledged deliveries go back to the queue
    async fn basic_cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    /// Close the channel; closing twice is a no-op
    async fn close(&self) -> Result<(), BrokerError>;
}

//! Broker administrative interface used for topology cleanup

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeInfo {
    pub name: String,
    #[serde(default)]
    pub vhost: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    #[serde(default)]
    pub consumers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingInfo {
    /// Source exchange; empty for the default exchange
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub destination_type: String,
    #[serde(default)]
    pub routing_key: String,
}

impl BindingInfo {
    pub fn to_queue(source: &str, queue: &str, routing_key: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: queue.to_string(),
            destination_type: "queue".to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    pub fn to_exchange(source: &str, exchange: &str, routing_key: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: exchange.to_string(),
            destination_type: "exchange".to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    pub fn touches(&self, name: &str) -> bool {
        self.source == name || self.destination == name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
        }
    }

    /// Users carrying any administrative tag
    pub fn is_privileged(&self) -> bool {
        self.tags
            .iter()
            .any(|t| matches!(t.as_str(), "administrator" | "management" | "monitoring" | "policymaker"))
    }
}

/// List/delete operations of the broker's management interface
#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn list_exchanges(&self) -> Result<Vec<ExchangeInfo>>;

    async fn list_queues(&self) -> Result<Vec<QueueInfo>>;

    async fn list_bindings(&self) -> Result<Vec<BindingInfo>>;

    async fn list_users(&self) -> Result<Vec<UserInfo>>;

    async fn delete_exchange(&self, name: &str) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn delete_user(&self, name: &str) -> Result<()>;
}

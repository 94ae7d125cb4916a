//! TwinSync Core
//!
//! This crate provides the device-twin ingestion pipeline:
//! - Broker topology naming and connection-string parsing
//! - Two-level device → template metadata cache
//! - Batching observation consumer with typed value decoding
//! - Connection lifecycle handler driven by an external poll loop
//! - Observation repositories (in-memory and `sled`)

pub mod broker;
pub mod cache;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod message;
pub mod model;
pub mod naming;
pub mod statistics;
pub mod storage;
pub mod value;

pub use cache::MetadataCache;
pub use connection::ConnectionDescriptor;
pub use consumer::{ConsumerStats, NotificationConsumer, TwinConsumer};
pub use error::{BrokerError, ConfigError, DecodeError, ResolveError, Result, TwinError};
pub use handler::{ConsumerConfig, ConsumerKind, CooldownPolicy, FixedCooldown, HandlerState, TwinHandler};
pub use message::{CacheNotification, ObservationMessage};
pub use model::{DeviceId, DeviceRecord, DeviceTemplate, IdentifiedObservation, ObservationSpec, TemplateId};
pub use statistics::{RunningStatistics, StatisticsSummary};
pub use value::{DataType, ObservationValue, Position};

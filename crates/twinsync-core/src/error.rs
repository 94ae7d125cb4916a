//! Error taxonomy for the ingestion pipeline
//!
//! Configuration errors are fatal and raised at construction time, broker
//! errors are recoverable by reconnecting, resolution and decode errors are
//! contained to a single message.

use crate::model::{DeviceId, TemplateId};
use thiserror::Error;

/// Startup-time configuration fault. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("connection string must have 3 to 6 comma-separated fields, found {found}")]
    InvalidArity { found: usize },

    #[error("invalid value for connection field '{field}': {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("unknown consumer type: {0}")]
    UnknownConsumerType(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

/// Broker connectivity and protocol failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("broker connection closed")]
    Closed,

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("queue not found: {0}")]
    QueueNotFound(String),
}

/// Failure to resolve a device against its template.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("device {mid} references missing template {tid}")]
    DanglingTemplate { mid: DeviceId, tid: TemplateId },

    #[error("repository lookup failed: {0}")]
    Repository(#[source] anyhow::Error),
}

impl ResolveError {
    /// Short stable label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownDevice(_) => "unknown_device",
            Self::DanglingTemplate { .. } => "dangling_template",
            Self::Repository(_) => "repository",
        }
    }
}

/// Failure to turn wire bytes into a typed observation.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("template {tid} has no observation {observation_id}")]
    UnknownObservation { tid: TemplateId, observation_id: u32 },

    #[error("observation {observation_id} declared as {declared} but template says {expected}")]
    TypeMismatch {
        observation_id: u32,
        declared: crate::value::DataType,
        expected: crate::value::DataType,
    },

    #[error("cannot decode {data_type} value: {reason}")]
    Value {
        data_type: crate::value::DataType,
        reason: String,
    },
}

impl DecodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Envelope(_) => "envelope",
            Self::UnknownObservation { .. } => "unknown_observation",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::Value { .. } => "undecodable_value",
        }
    }
}

/// Umbrella error surfaced to the handler's control loop.
#[derive(Debug, Error)]
pub enum TwinError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("persistence failed: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl TwinError {
    /// Fatal errors must not be retried by the poll loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

pub type Result<T, E = TwinError> = std::result::Result<T, E>;

//! Wire formats consumed from the broker
//!
//! Observation envelopes published by devices, and metadata change
//! notifications published by management tooling.

use crate::error::DecodeError;
use crate::model::{DeviceId, TemplateId};
use crate::value::DataType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound observation envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationMessage {
    pub mid: DeviceId,
    pub observation_id: u32,
    pub data_type: DataType,
    /// Raw payload, decoded according to the template's declared type
    pub value: serde_json::Value,
    /// Device-side sample time; receipt time is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ObservationMessage {
    pub fn new(
        mid: impl Into<DeviceId>,
        observation_id: u32,
        data_type: DataType,
        value: serde_json::Value,
    ) -> Self {
        Self {
            mid: mid.into(),
            observation_id,
            data_type,
            value,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        // Serializing plain data with string keys cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Metadata change notification driving cache invalidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CacheNotification {
    /// Device was reassigned or deleted
    DeviceChanged { mid: DeviceId },
    /// Template definition was edited or deleted
    TemplateChanged { tid: TemplateId },
}

impl CacheNotification {
    pub fn from_slice(body: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

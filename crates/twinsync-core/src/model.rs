//! Devices, templates and identified observations
//!
//! Devices and templates are owned by the backing repository; the cache and
//! the consumer only ever hold read-through copies.

use crate::value::{DataType, ObservationValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Machine id (MID): opaque identifier of one physical device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(mid: impl Into<String>) -> Self {
        Self(mid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Template id (TID): identifies a twin schema shared by many devices
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub String);

impl TemplateId {
    pub fn new(tid: impl Into<String>) -> Self {
        Self(tid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TemplateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Repository view of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub mid: DeviceId,
    pub template_id: TemplateId,
}

impl DeviceRecord {
    pub fn new(mid: impl Into<DeviceId>, template_id: impl Into<TemplateId>) -> Self {
        Self {
            mid: mid.into(),
            template_id: template_id.into(),
        }
    }
}

/// One observation slot declared by a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationSpec {
    pub id: u32,
    pub name: String,
    pub data_type: DataType,
    /// When set, numeric samples are compressed into one statistics
    /// observation per window of this many seconds.
    #[serde(default)]
    pub aggregation_window_secs: Option<u64>,
}

impl ObservationSpec {
    pub fn new(id: u32, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            aggregation_window_secs: None,
        }
    }

    #[must_use]
    pub fn aggregated(mut self, window_secs: u64) -> Self {
        self.aggregation_window_secs = Some(window_secs);
        self
    }
}

/// Twin schema: the observations a device of this template may report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTemplate {
    pub id: TemplateId,
    pub name: String,
    pub observations: BTreeMap<u32, ObservationSpec>,
}

impl DeviceTemplate {
    pub fn new(id: impl Into<TemplateId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            observations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_observation(mut self, spec: ObservationSpec) -> Self {
        self.observations.insert(spec.id, spec);
        self
    }

    pub fn observation(&self, id: u32) -> Option<&ObservationSpec> {
        self.observations.get(&id)
    }
}

/// An observation after metadata resolution; the unit that gets persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifiedObservation {
    pub mid: DeviceId,
    pub observation_id: u32,
    pub value: ObservationValue,
    pub timestamp: DateTime<Utc>,
}

impl IdentifiedObservation {
    /// Key under which redelivered copies collapse onto one stored record.
    pub fn dedup_key(&self) -> (DeviceId, u32, DateTime<Utc>) {
        (self.mid.clone(), self.observation_id, self.timestamp)
    }
}

impl fmt::Display for IdentifiedObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}#{} = {}",
            self.timestamp, self.mid, self.observation_id, self.value
        )
    }
}

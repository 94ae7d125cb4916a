//! Broker topology and cache-key naming
//!
//! Every exchange, queue, topic and cache key used by the platform is derived
//! here from domain identifiers. The functions are pure: the same inputs
//! always give the same name, and distinct identifiers never collide because
//! each object kind has its own prefix. The only exception is
//! [`temporary_pair`], which appends a fresh UUID on every call.
//!
//! Names scoped by user and key escape `.` and `%` in both parts, so dotted
//! identifiers such as e-mail addresses stay unambiguous.

use crate::model::{DeviceId, TemplateId};
use uuid::Uuid;

pub const ROOT_EXCHANGE: &str = "twin.root";
pub const BRIDGE_EXCHANGE: &str = "twin.bridge";

const DEVICE_PREFIX: &str = "dev.";
const TEMPLATE_PREFIX: &str = "tpl.";
const USER_PREFIX: &str = "usr.";
const TEMPORARY_PREFIX: &str = "tmp.";
const WHITELIST_PREFIX: &str = "wl.";
const PERSISTENT_PREFIX: &str = "per.";
const QUEUE_SUFFIX: &str = ".q";

/// Exchange plus the queue bound to it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopologyPair {
    pub exchange: String,
    pub queue: String,
}

impl TopologyPair {
    fn from_exchange(exchange: String) -> Self {
        let queue = format!("{exchange}{QUEUE_SUFFIX}");
        Self { exchange, queue }
    }
}

pub fn root_exchange() -> &'static str {
    ROOT_EXCHANGE
}

pub fn bridge_exchange() -> &'static str {
    BRIDGE_EXCHANGE
}

pub fn device_exchange(mid: &DeviceId) -> String {
    format!("{DEVICE_PREFIX}{mid}")
}

/// Native queue a device consumes commands from
pub fn device_queue(mid: &DeviceId) -> String {
    format!("{DEVICE_PREFIX}{mid}{QUEUE_SUFFIX}")
}

/// Queue the MQTT bridge plugin creates for a device session (QoS 1)
pub fn device_bridge_queue(mid: &DeviceId) -> String {
    format!("mqtt-subscription-{mid}qos1")
}

/// Topic a device publishes observations on
pub fn device_publish_topic(mid: &DeviceId) -> String {
    format!("dev/{mid}/obs")
}

/// Topic a device subscribes to for commands
pub fn device_subscribe_topic(mid: &DeviceId) -> String {
    format!("dev/{mid}/cmd")
}

pub fn template_publish_exchange(tid: &TemplateId) -> String {
    format!("{TEMPLATE_PREFIX}{tid}.pub")
}

pub fn template_subscribe_exchange(tid: &TemplateId) -> String {
    format!("{TEMPLATE_PREFIX}{tid}.sub")
}

pub fn user_exchange(user_id: &str) -> String {
    format!("{USER_PREFIX}{user_id}")
}

/// Short-lived subscription pair; unique per call
pub fn temporary_pair(user_id: &str) -> TopologyPair {
    TopologyPair::from_exchange(format!(
        "{TEMPORARY_PREFIX}{user_id}.{}",
        Uuid::new_v4().simple()
    ))
}

pub fn whitelist_pair(user_id: &str, key: &str) -> TopologyPair {
    TopologyPair::from_exchange(format!(
        "{WHITELIST_PREFIX}{}.{}",
        escape(user_id),
        escape(key)
    ))
}

pub fn persistent_pair(user_id: &str, key: &str) -> TopologyPair {
    TopologyPair::from_exchange(format!(
        "{PERSISTENT_PREFIX}{}.{}",
        escape(user_id),
        escape(key)
    ))
}

pub fn device_cache_key(mid: &DeviceId) -> String {
    format!("twin:device:{mid}")
}

pub fn template_cache_key(tid: &TemplateId) -> String {
    format!("twin:template:{tid}")
}

/// MQTT topic levels map onto AMQP routing-key words.
pub fn topic_to_routing_key(topic: &str) -> String {
    topic.replace('/', ".")
}

/// Entity an exchange name belongs to, recovered from its prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopologyOwner {
    Root,
    Bridge,
    Device(DeviceId),
    Template(TemplateId),
    User(String),
    Temporary { user_id: String },
    Whitelist { user_id: String, key: String },
    Persistent { user_id: String, key: String },
}

impl TopologyOwner {
    /// Root and bridge exchanges are infrastructure, never reclaimed.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Root | Self::Bridge)
    }

    /// Broker user that owns the object, if any
    pub fn user(&self) -> Option<&str> {
        match self {
            Self::Device(mid) => Some(mid.as_str()),
            Self::User(user_id)
            | Self::Temporary { user_id }
            | Self::Whitelist { user_id, .. }
            | Self::Persistent { user_id, .. } => Some(user_id),
            Self::Root | Self::Bridge | Self::Template(_) => None,
        }
    }
}

/// Reverse [`device_exchange`], [`user_exchange`] and friends.
///
/// Returns `None` for names this platform did not create.
pub fn classify_exchange(name: &str) -> Option<TopologyOwner> {
    if name == ROOT_EXCHANGE {
        return Some(TopologyOwner::Root);
    }
    if name == BRIDGE_EXCHANGE {
        return Some(TopologyOwner::Bridge);
    }
    if let Some(rest) = name.strip_prefix(DEVICE_PREFIX) {
        return non_empty(rest).map(|mid| TopologyOwner::Device(DeviceId::new(mid)));
    }
    if let Some(rest) = name.strip_prefix(TEMPLATE_PREFIX) {
        let tid = rest
            .strip_suffix(".pub")
            .or_else(|| rest.strip_suffix(".sub"))?;
        return non_empty(tid).map(|tid| TopologyOwner::Template(TemplateId::new(tid)));
    }
    if let Some(rest) = name.strip_prefix(USER_PREFIX) {
        return non_empty(rest).map(|u| TopologyOwner::User(u.to_string()));
    }
    if let Some(rest) = name.strip_prefix(TEMPORARY_PREFIX) {
        let (user_id, _) = rest.rsplit_once('.')?;
        return non_empty(user_id).map(|u| TopologyOwner::Temporary {
            user_id: u.to_string(),
        });
    }
    if let Some(rest) = name.strip_prefix(WHITELIST_PREFIX) {
        let (user_id, key) = split_scoped(rest)?;
        return Some(TopologyOwner::Whitelist { user_id, key });
    }
    if let Some(rest) = name.strip_prefix(PERSISTENT_PREFIX) {
        let (user_id, key) = split_scoped(rest)?;
        return Some(TopologyOwner::Persistent { user_id, key });
    }
    None
}

/// Queue paired with an exchange created through [`TopologyPair`]
pub fn paired_queue(exchange: &str) -> String {
    format!("{exchange}{QUEUE_SUFFIX}")
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

fn split_scoped(rest: &str) -> Option<(String, String)> {
    let (user_id, key) = rest.split_once('.')?;
    if user_id.is_empty() || key.is_empty() {
        return None;
    }
    Some((unescape(user_id)?, unescape(key)?))
}

fn escape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            '.' => out.push_str("%2E"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`]; `None` for sequences it never produces
fn unescape(part: &str) -> Option<String> {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let code = rest.get(at + 1..at + 3)?;
        out.push(match code {
            "25" => '%',
            "2E" => '.',
            _ => return None,
        });
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    Some(out)
}

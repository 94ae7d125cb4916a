//! Daemon settings from `TWINSYNC_*` environment variables
//!
//! A `.env` file is honoured when present. The consumer section can also come
//! from a JSON file named by `TWINSYNC_CONSUMER_CONFIG`; individual variables
//! override what the file sets.

use crate::restart::RetryPolicy;
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use twinsync_core::{ConfigError, ConnectionDescriptor, ConsumerConfig};

pub const BROKER: &str = "TWINSYNC_BROKER";
pub const MANAGEMENT: &str = "TWINSYNC_MANAGEMENT";
pub const CONSUMER_CONFIG: &str = "TWINSYNC_CONSUMER_CONFIG";
pub const QUEUE: &str = "TWINSYNC_QUEUE";
pub const NOTIFICATION_QUEUE: &str = "TWINSYNC_NOTIFICATION_QUEUE";
pub const PREFETCH: &str = "TWINSYNC_PREFETCH";
pub const BATCH_SIZE: &str = "TWINSYNC_BATCH_SIZE";
pub const THREADS: &str = "TWINSYNC_THREADS";
pub const MAX_TIME_IN_BUFFER: &str = "TWINSYNC_MAX_TIME_IN_BUFFER_SECS";
pub const RECONNECT_COOLDOWN: &str = "TWINSYNC_RECONNECT_COOLDOWN_SECS";
/// JSON [`RetryPolicy`]; replaces the fixed reconnect cooldown
pub const RETRY_POLICY: &str = "TWINSYNC_RETRY_POLICY";
pub const MQTT_PORT: &str = "TWINSYNC_MQTT_PORT";
pub const STORE_PATH: &str = "TWINSYNC_STORE_PATH";
pub const POLL_INTERVAL_MS: &str = "TWINSYNC_POLL_INTERVAL_MS";
pub const JANITOR_INTERVAL: &str = "TWINSYNC_JANITOR_INTERVAL_SECS";
pub const PROTECTED_USERS: &str = "TWINSYNC_PROTECTED_USERS";
pub const LOG_JSON: &str = "TWINSYNC_LOG_JSON";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("cannot read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed consumer config: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub broker: ConnectionDescriptor,
    pub consumer: ConsumerConfig,
    /// Port of the broker's MQTT listener
    pub mqtt_port: u16,
    pub store_path: PathBuf,
    pub poll_interval: Duration,
    /// Janitor is disabled without a management endpoint
    pub management: Option<ConnectionDescriptor>,
    pub janitor_interval: Duration,
    pub protected_users: HashSet<String>,
    pub restart: RetryPolicy,
    pub log_json: bool,
}

impl Settings {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self, SettingsError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let broker = ConnectionDescriptor::parse(&var(BROKER).ok_or(SettingsError::Missing(BROKER))?)?;
        let management = var(MANAGEMENT)
            .map(|s| ConnectionDescriptor::parse(&s))
            .transpose()?;

        let mut consumer = match var(CONSUMER_CONFIG) {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| SettingsError::File {
                    path: path.clone(),
                    source,
                })?;
                serde_json::from_str(&raw)?
            }
            None => ConsumerConfig::default(),
        };
        if let Some(queue) = var(QUEUE) {
            consumer.queue = queue;
        }
        if let Some(queue) = var(NOTIFICATION_QUEUE) {
            consumer.notification_queue = Some(queue);
        }
        if let Some(v) = var(PREFETCH) {
            consumer.prefetch = parse(PREFETCH, &v)?;
        }
        if let Some(v) = var(BATCH_SIZE) {
            consumer.batch_size = parse(BATCH_SIZE, &v)?;
        }
        if let Some(v) = var(THREADS) {
            consumer.threads = parse(THREADS, &v)?;
        }
        if let Some(v) = var(MAX_TIME_IN_BUFFER) {
            consumer.max_time_in_buffer_secs = parse(MAX_TIME_IN_BUFFER, &v)?;
        }
        if let Some(v) = var(RECONNECT_COOLDOWN) {
            consumer.reconnect_cooldown_secs = parse(RECONNECT_COOLDOWN, &v)?;
        }
        consumer.validate()?;

        let restart = match var(RETRY_POLICY) {
            Some(v) => serde_json::from_str(&v).map_err(|_| SettingsError::Invalid {
                key: RETRY_POLICY,
                value: v,
            })?,
            None => RetryPolicy::fixed(consumer.reconnect_cooldown()),
        };

        let mqtt_port = match var(MQTT_PORT) {
            Some(v) => parse(MQTT_PORT, &v)?,
            None if broker.tls => 8883,
            None => 1883,
        };

        // The daemon's own broker accounts are never reclaimed
        let mut protected_users: HashSet<String> = var(PROTECTED_USERS)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        protected_users.insert(broker.user.clone());
        if let Some(management) = &management {
            protected_users.insert(management.user.clone());
        }

        Ok(Self {
            restart,
            consumer,
            mqtt_port,
            store_path: PathBuf::from(var(STORE_PATH).unwrap_or_else(|| "twinsync.db".to_string())),
            poll_interval: Duration::from_millis(match var(POLL_INTERVAL_MS) {
                Some(v) => parse(POLL_INTERVAL_MS, &v)?,
                None => 100,
            }),
            janitor_interval: Duration::from_secs(match var(JANITOR_INTERVAL) {
                Some(v) => parse(JANITOR_INTERVAL, &v)?,
                None => 300,
            }),
            management,
            protected_users,
            log_json: var(LOG_JSON).is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes")),
            broker,
        })
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::Invalid {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_minimal_environment_uses_defaults() {
        let settings = Settings::from_lookup(lookup(&[(BROKER, "rabbit,twinsync,secret,false")])).unwrap();

        assert_eq!(settings.broker.port, 5672);
        assert_eq!(settings.mqtt_port, 1883);
        assert_eq!(settings.consumer, ConsumerConfig::default());
        assert!(settings.management.is_none());
        assert!(settings.protected_users.contains("twinsync"));
        assert_eq!(settings.janitor_interval, Duration::from_secs(300));
        assert_eq!(settings.restart, RetryPolicy::Fixed { secs: 5 });
        assert!(!settings.log_json);
    }

    #[test]
    fn test_overrides_and_management() {
        let settings = Settings::from_lookup(lookup(&[
            (BROKER, "rabbit,twinsync,secret,true"),
            (MANAGEMENT, "rabbit,admin,pw"),
            (BATCH_SIZE, "20"),
            (PREFETCH, "40"),
            (THREADS, "3"),
            (PROTECTED_USERS, "ops, monitor"),
            (LOG_JSON, "true"),
            (RETRY_POLICY, r#"{"kind":"exponential","initial_ms":200,"max_secs":60,"multiplier":2.0}"#),
        ]))
        .unwrap();

        assert_eq!(settings.mqtt_port, 8883);
        assert_eq!(settings.consumer.batch_size, 20);
        assert_eq!(settings.consumer.prefetch, 40);
        assert_eq!(settings.consumer.threads, 3);
        assert_eq!(settings.management.unwrap().port, 15671);
        for user in ["ops", "monitor", "twinsync", "admin"] {
            assert!(settings.protected_users.contains(user), "{user}");
        }
        assert!(settings.log_json);
        assert!(matches!(settings.restart, RetryPolicy::Exponential { max_secs: 60, .. }));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        assert!(matches!(
            Settings::from_lookup(lookup(&[])),
            Err(SettingsError::Missing(BROKER))
        ));
        assert!(matches!(
            Settings::from_lookup(lookup(&[(BROKER, "rabbit,only")])),
            Err(SettingsError::Config(ConfigError::InvalidArity { found: 2 }))
        ));
        assert!(matches!(
            Settings::from_lookup(lookup(&[(BROKER, "rabbit,u,p,false"), (BATCH_SIZE, "many")])),
            Err(SettingsError::Invalid { key: BATCH_SIZE, .. })
        ));
        assert!(matches!(
            Settings::from_lookup(lookup(&[(BROKER, "rabbit,u,p,false"), (BATCH_SIZE, "0")])),
            Err(SettingsError::Config(ConfigError::InvalidSetting(_)))
        ));
    }

    #[test]
    fn test_consumer_config_file_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumer.json");
        std::fs::write(&path, r#"{"queue":"obs.eu","batch_size":10,"notification_queue":"twin.changes"}"#).unwrap();

        let settings = Settings::from_lookup(lookup(&[
            (BROKER, "rabbit,u,p,false"),
            (CONSUMER_CONFIG, path.to_str().unwrap()),
            (BATCH_SIZE, "25"),
        ]))
        .unwrap();

        assert_eq!(settings.consumer.queue, "obs.eu");
        assert_eq!(settings.consumer.batch_size, 25);
        assert_eq!(settings.consumer.notification_queue.as_deref(), Some("twin.changes"));
    }
}

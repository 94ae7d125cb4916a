//! Broker connection string parsing
//!
//! Format: `<host>,<user>,<password>[,<tls>][,<port>][,<vhost>]`.

use crate::error::ConfigError;
use std::fmt;
use std::str::FromStr;

const DELIMITER: char = ',';

/// Port assumed for the three-field form (TLS management endpoint).
pub const ADMIN_TLS_PORT: u16 = 15671;
pub const TLS_PORT: u16 = 5671;
pub const PLAIN_PORT: u16 = 5672;
pub const DEFAULT_VHOST: &str = "/";

/// Parsed broker endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub user: String,
    pub password: String,
    pub tls: bool,
    pub port: u16,
    pub virtual_host: String,
}

impl ConnectionDescriptor {
    /// Parse a connection string; any arity outside 3..=6 is fatal.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let fields: Vec<&str> = s.split(DELIMITER).map(str::trim).collect();
        if !(3..=6).contains(&fields.len()) {
            return Err(ConfigError::InvalidArity {
                found: fields.len(),
            });
        }

        let host = required("host", fields[0])?;
        let user = required("user", fields[1])?;
        let password = fields[2].to_string();

        let (tls, port, virtual_host) = match fields.len() {
            3 => (true, ADMIN_TLS_PORT, DEFAULT_VHOST.to_string()),
            4 => {
                let tls = parse_tls(fields[3])?;
                (tls, default_port(tls), DEFAULT_VHOST.to_string())
            }
            5 => (
                parse_tls(fields[3])?,
                parse_port(fields[4])?,
                DEFAULT_VHOST.to_string(),
            ),
            _ => (
                parse_tls(fields[3])?,
                parse_port(fields[4])?,
                required("vhost", fields[5])?,
            ),
        };

        Ok(Self {
            host,
            user,
            password,
            tls,
            port,
            virtual_host,
        })
    }

    /// `amqp://` / `amqps://` URI for clients that take one
    pub fn amqp_uri(&self) -> String {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        let vhost = if self.virtual_host == DEFAULT_VHOST {
            "%2f".to_string()
        } else {
            self.virtual_host.clone()
        };
        format!(
            "{scheme}://{}:{}@{}:{}/{vhost}",
            self.user, self.password, self.host, self.port
        )
    }
}

fn required(field: &'static str, value: &str) -> Result<String, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn parse_tls(value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::InvalidField {
            field: "tls",
            value: value.to_string(),
        }),
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ConfigError::InvalidField {
            field: "port",
            value: value.to_string(),
        })
}

fn default_port(tls: bool) -> u16 {
    if tls {
        TLS_PORT
    } else {
        PLAIN_PORT
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Keeps the password out of logs.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"***")
            .field("tls", &self.tls)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "tls" } else { "tcp" };
        write!(
            f,
            "{scheme}://{}@{}:{}{}",
            self.user, self.host, self.port, self.virtual_host
        )
    }
}

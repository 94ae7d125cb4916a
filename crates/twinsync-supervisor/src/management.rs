//! RabbitMQ management REST client

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use twinsync_core::broker::{BindingInfo, ExchangeInfo, ManagementApi, QueueInfo, UserInfo};
use twinsync_core::ConnectionDescriptor;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ManagementApi`] over the broker's HTTP management plugin
pub struct HttpManagementApi {
    client: Client,
    base_url: String,
    vhost: String,
    user: String,
    password: String,
}

impl HttpManagementApi {
    /// Target the management endpoint named by the descriptor
    pub fn new(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building management HTTP client")?;
        let scheme = if descriptor.tls { "https" } else { "http" };

        Ok(Self {
            client,
            base_url: format!("{scheme}://{}:{}", descriptor.host, descriptor.port),
            vhost: descriptor.virtual_host.clone(),
            user: descriptor.user.clone(),
            password: descriptor.password.clone(),
        })
    }

    fn endpoint(&self, kind: &str, name: Option<&str>) -> String {
        let mut url = format!("{}/api/{kind}", self.base_url);
        if kind != "users" {
            url.push('/');
            url.push_str(&urlencoding::encode(&self.vhost));
        }
        if let Some(name) = name {
            url.push('/');
            url.push_str(&urlencoding::encode(name));
        }
        url
    }

    async fn get<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        response
            .json()
            .await
            .with_context(|| format!("decoding response of GET {url}"))
    }

    async fn delete(&self, url: String) -> Result<()> {
        let response = self
            .client
            .request(Method::DELETE, &url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .with_context(|| format!("DELETE {url}"))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => anyhow::bail!("DELETE {url}: not found"),
            s => anyhow::bail!("DELETE {url}: {s}"),
        }
    }
}

/// Older brokers report tags as one comma-separated string
#[derive(Deserialize)]
struct RawUser {
    name: String,
    #[serde(default)]
    tags: serde_json::Value,
}

impl From<RawUser> for UserInfo {
    fn from(raw: RawUser) -> Self {
        let tags = match raw.tags {
            serde_json::Value::String(s) => s
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter_map(|t| t.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };
        UserInfo { name: raw.name, tags }
    }
}

#[async_trait]
impl ManagementApi for HttpManagementApi {
    async fn list_exchanges(&self) -> Result<Vec<ExchangeInfo>> {
        self.get(self.endpoint("exchanges", None)).await
    }

    async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        self.get(self.endpoint("queues", None)).await
    }

    async fn list_bindings(&self) -> Result<Vec<BindingInfo>> {
        self.get(self.endpoint("bindings", None)).await
    }

    async fn list_users(&self) -> Result<Vec<UserInfo>> {
        let raw: Vec<RawUser> = self.get(self.endpoint("users", None)).await?;
        Ok(raw.into_iter().map(UserInfo::from).collect())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.delete(self.endpoint("exchanges", Some(name))).await
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.delete(self.endpoint("queues", Some(name))).await
    }

    async fn delete_user(&self, name: &str) -> Result<()> {
        self.delete(self.endpoint("users", Some(name))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(connection: &str) -> HttpManagementApi {
        HttpManagementApi::new(&ConnectionDescriptor::parse(connection).unwrap()).unwrap()
    }

    #[test]
    fn test_endpoints_encode_vhost_and_names() {
        let api = api("rabbit.local,admin,secret");
        assert_eq!(
            api.endpoint("exchanges", None),
            "https://rabbit.local:15671/api/exchanges/%2F"
        );
        assert_eq!(
            api.endpoint("queues", Some("wl.alice.k1.q")),
            "https://rabbit.local:15671/api/queues/%2F/wl.alice.k1.q"
        );
        assert_eq!(
            api.endpoint("users", Some("D 1")),
            "https://rabbit.local:15671/api/users/D%201"
        );
    }

    #[test]
    fn test_plain_endpoint_with_custom_vhost() {
        let api = api("localhost,guest,guest,false,15672,twins");
        assert_eq!(
            api.endpoint("bindings", None),
            "http://localhost:15672/api/bindings/twins"
        );
    }

    #[test]
    fn test_user_tags_in_both_formats() {
        let users: Vec<RawUser> = serde_json::from_str(
            r#"[
                {"name":"admin","tags":"administrator, monitoring"},
                {"name":"ops","tags":["management"]},
                {"name":"D1","tags":""},
                {"name":"D2"}
            ]"#,
        )
        .unwrap();
        let users: Vec<UserInfo> = users.into_iter().map(UserInfo::from).collect();

        assert_eq!(users[0].tags, vec!["administrator", "monitoring"]);
        assert!(users[0].is_privileged());
        assert!(users[1].is_privileged());
        assert!(users[2].tags.is_empty());
        assert!(!users[3].is_privileged());
    }

    #[test]
    fn test_listing_payloads_decode() {
        let queues: Vec<QueueInfo> =
            serde_json::from_str(r#"[{"name":"dev.D1.q","consumers":2,"messages":7}]"#).unwrap();
        assert_eq!(queues[0].consumers, 2);

        let bindings: Vec<BindingInfo> = serde_json::from_str(
            r#"[{"source":"twin.root","destination":"dev.D1","destination_type":"exchange","routing_key":"dev.D1.#","vhost":"/"}]"#,
        )
        .unwrap();
        assert_eq!(bindings[0], BindingInfo::to_exchange("twin.root", "dev.D1", "dev.D1.#"));
    }
}

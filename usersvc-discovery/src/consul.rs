//! Consul HTTP API backend

use crate::backend::{DiscoveryBackend, KvEntry, QueryMeta, QueryOptions, WatchIndex};
use crate::config::DiscoveryConfig;
use crate::error::{BackendError, DiscoveryError};
use crate::service::{CheckTarget, HealthStatus, ServiceEntry, ServiceRegistration};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Backend speaking the Consul agent HTTP API.
///
/// # Examples
///
/// ```rust,ignore
/// use usersvc_discovery::{ConsulBackend, DiscoveryConfig};
///
/// let consul = ConsulBackend::new(&DiscoveryConfig::new("127.0.0.1:8500"))?;
/// ```
#[derive(Debug, Clone)]
pub struct ConsulBackend {
    base_url: Url,
    http: reqwest::Client,
    token: Option<String>,
    datacenter: Option<String>,
    timeout: Duration,
}

impl ConsulBackend {
    /// Create a backend from a (normalized) config.
    pub fn new(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let base_url = config.base_url()?;
        if base_url.cannot_be_a_base() {
            return Err(DiscoveryError::Config(format!(
                "address cannot be used as a base URL: {}",
                base_url
            )));
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("usersvc-discovery/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DiscoveryError::Connection(e.to_string()))?;

        Ok(Self {
            base_url,
            http,
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
            timeout: config.timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build `<base>/v1/<segments...>`, percent-encoding each segment.
    fn endpoint<'a, I>(&self, segments: I) -> Result<Url, BackendError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Unavailable(format!("invalid agent URL {}", self.base_url)))?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    /// `<base>/v1/kv/<key>`. One leading `/` is dropped; `.` and `..`
    /// segments are rejected since URL normalization would remove them.
    fn kv_url(&self, key: &str) -> Result<Url, BackendError> {
        let key = key.strip_prefix('/').unwrap_or(key);
        if key.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(BackendError::InvalidKey(key.to_string()));
        }
        self.endpoint(std::iter::once("kv").chain(key.split('/')))
    }

    /// Start a request with the token header, datacenter and blocking params.
    fn request(&self, method: Method, url: Url, opts: QueryOptions) -> RequestBuilder {
        let mut timeout = self.timeout;
        let mut query: Vec<(&str, String)> = Vec::new();

        if let Some(dc) = &self.datacenter {
            query.push(("dc", dc.clone()));
        }
        if let Some(index) = opts.wait_index {
            query.push(("index", index.get().to_string()));
        }
        if let Some(wait) = opts.wait_time {
            query.push(("wait", go_duration(wait)));
            // the agent may hold the request for wait + wait/16
            timeout += wait + wait / 16;
        }

        let mut request = self.http.request(method, url).timeout(timeout);
        if !query.is_empty() {
            request = request.query(&query);
        }
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        request
    }

    /// Turn a non-success response into [`BackendError::Status`].
    async fn check(response: Response) -> Result<Response, BackendError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .map(|body| body.trim().to_string())
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(BackendError::Status { status, message })
    }

    fn query_meta(response: &Response) -> QueryMeta {
        let last_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        QueryMeta {
            last_index: WatchIndex::new(last_index),
        }
    }

    /// Registration payload in the agent's PascalCase format.
    fn registration_payload(registration: &ServiceRegistration) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "ID": registration.id,
            "Name": registration.name,
            "Port": registration.port,
            "Tags": registration.tags,
            "Meta": registration.meta,
        });

        if !registration.address.is_empty() {
            payload["Address"] = serde_json::json!(registration.address);
        }

        if let Some(spec) = &registration.check {
            let mut check = serde_json::json!({});
            if !spec.check_id.is_empty() {
                check["CheckID"] = serde_json::json!(spec.check_id);
            }
            if !spec.interval.is_zero() {
                check["Interval"] = serde_json::json!(go_duration(spec.interval));
            }
            if !spec.timeout.is_zero() {
                check["Timeout"] = serde_json::json!(go_duration(spec.timeout));
            }
            if !spec.deregister_critical_after.is_zero() {
                check["DeregisterCriticalServiceAfter"] =
                    serde_json::json!(go_duration(spec.deregister_critical_after));
            }
            match &spec.target {
                CheckTarget::Http(url) => check["HTTP"] = serde_json::json!(url),
                CheckTarget::Tcp(addr) => check["TCP"] = serde_json::json!(addr),
                CheckTarget::Grpc(endpoint) => check["GRPC"] = serde_json::json!(endpoint),
            }
            payload["Check"] = check;
        }

        payload
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthServiceEntry {
    #[serde(default)]
    node: ConsulNode,
    service: ConsulService,
    #[serde(default)]
    checks: Vec<ConsulCheck>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct ConsulNode {
    node: String,
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulCheck {
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulKvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    modify_index: u64,
}

impl From<HealthServiceEntry> for ServiceEntry {
    fn from(entry: HealthServiceEntry) -> Self {
        let status = HealthStatus::aggregate(
            entry
                .checks
                .iter()
                .map(|check| HealthStatus::from_consul(&check.status)),
        );
        // an empty service address means "use the node's"
        let address = if entry.service.address.is_empty() {
            entry.node.address
        } else {
            entry.service.address
        };

        ServiceEntry {
            id: entry.service.id,
            service: entry.service.service,
            node: entry.node.node,
            address,
            port: entry.service.port,
            tags: entry.service.tags.unwrap_or_default(),
            status,
        }
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulBackend {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<(), BackendError> {
        let url = self.endpoint(["agent", "service", "register"])?;
        let payload = Self::registration_payload(registration);

        let response = self
            .request(Method::PUT, url, QueryOptions::default())
            .json(&payload)
            .send()
            .await?;
        Self::check(response).await?;

        info!("Registered service {} with Consul", registration.id);
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), BackendError> {
        let url = self.endpoint(["agent", "service", "deregister", service_id])?;

        let response = self
            .request(Method::PUT, url, QueryOptions::default())
            .send()
            .await?;

        match Self::check(response).await {
            Ok(_) => {
                info!("Deregistered service {} from Consul", service_id);
                Ok(())
            }
            Err(BackendError::Status { status, message })
                if status == 404 || message.contains("Unknown service") =>
            {
                Err(BackendError::NotFound(format!("service ID {}", service_id)))
            }
            Err(e) => Err(e),
        }
    }

    async fn health_service(
        &self,
        service: &str,
        passing_only: bool,
        opts: QueryOptions,
    ) -> Result<(Vec<ServiceEntry>, QueryMeta), BackendError> {
        let url = self.endpoint(["health", "service", service])?;

        let mut request = self.request(Method::GET, url, opts);
        if passing_only {
            request = request.query(&[("passing", "true")]);
        }

        let response = Self::check(request.send().await?).await?;
        let meta = Self::query_meta(&response);

        let entries: Vec<HealthServiceEntry> = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        let instances: Vec<ServiceEntry> = entries.into_iter().map(ServiceEntry::from).collect();

        debug!(
            "Discovered {} instances of service {} (index {})",
            instances.len(),
            service,
            meta.last_index
        );
        Ok((instances, meta))
    }

    async fn kv_get(
        &self,
        key: &str,
        opts: QueryOptions,
    ) -> Result<(Option<KvEntry>, QueryMeta), BackendError> {
        let url = self.kv_url(key)?;

        let response = self.request(Method::GET, url, opts).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok((None, Self::query_meta(&response)));
        }

        let response = Self::check(response).await?;
        let meta = Self::query_meta(&response);

        let pairs: Vec<ConsulKvPair> = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        let entry = match pairs.into_iter().next() {
            Some(pair) => {
                let value = match pair.value {
                    Some(encoded) => BASE64
                        .decode(encoded.as_bytes())
                        .map_err(|e| BackendError::Decode(format!("value of {}: {}", pair.key, e)))?,
                    None => Vec::new(),
                };
                Some(KvEntry {
                    key: pair.key,
                    value,
                    modify_index: WatchIndex::new(pair.modify_index),
                })
            }
            None => None,
        };

        Ok((entry, meta))
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<bool, BackendError> {
        let url = self.kv_url(key)?;

        let response = self
            .request(Method::PUT, url, QueryOptions::default())
            .body(value.to_vec())
            .send()
            .await?;
        let body = Self::check(response).await?.text().await?;

        debug!("Put key {} ({} bytes)", key, value.len());
        Ok(body.trim() == "true")
    }

    async fn kv_delete(&self, key: &str) -> Result<(), BackendError> {
        let url = self.kv_url(key)?;

        let response = self
            .request(Method::DELETE, url, QueryOptions::default())
            .send()
            .await?;
        Self::check(response).await?;

        debug!("Deleted key {}", key);
        Ok(())
    }
}

/// Render a duration the way Go's `time.ParseDuration` reads it, in the
/// largest unit that keeps it exact.
pub(crate) fn go_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos % 1_000_000_000 == 0 {
        format!("{}s", nanos / 1_000_000_000)
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!("{}us", nanos / 1_000)
    } else {
        format!("{}ns", nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::HealthCheckSpec;

    fn backend(address: &str) -> ConsulBackend {
        let config = DiscoveryConfig::new(address).normalized().unwrap();
        ConsulBackend::new(&config).unwrap()
    }

    #[test]
    fn test_consul_backend_creation() {
        let consul = backend("localhost:8500");
        assert_eq!(consul.base_url().as_str(), "http://localhost:8500/");
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let consul = backend("localhost:8500");
        let url = consul
            .endpoint(std::iter::once("kv").chain("config/user server".split('/')))
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost:8500/v1/kv/config/user%20server");

        let consul = backend("http://proxy.local/consul/");
        let url = consul.endpoint(["agent", "self"]).unwrap();
        assert_eq!(url.as_str(), "http://proxy.local/consul/v1/agent/self");
    }

    #[test]
    fn test_kv_url_normalizes_key() {
        let consul = backend("localhost:8500");

        let url = consul.kv_url("/config/user").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8500/v1/kv/config/user");

        for key in ["a/./b", "a/../b", "..", "/./x"] {
            assert!(matches!(consul.kv_url(key), Err(BackendError::InvalidKey(_))), "{}", key);
        }
    }

    #[test]
    fn test_go_duration() {
        assert_eq!(go_duration(Duration::from_secs(10)), "10s");
        assert_eq!(go_duration(Duration::from_secs(90)), "90s");
        assert_eq!(go_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(go_duration(Duration::ZERO), "0s");
        assert_eq!(go_duration(Duration::from_micros(250)), "250us");
        assert_eq!(go_duration(Duration::from_nanos(1_000_500)), "1000500ns");
    }

    #[test]
    fn test_registration_payload_sets_single_target() {
        let registration = ServiceRegistration::new("user-1", "user", "10.0.0.5", 17191)
            .with_tag("tars")
            .with_check(
                HealthCheckSpec::grpc("user-grpc", "10.0.0.5:17192")
                    .deregister_after(Duration::from_secs(60)),
            );

        let payload = ConsulBackend::registration_payload(&registration);
        assert_eq!(payload["ID"], "user-1");
        assert_eq!(payload["Address"], "10.0.0.5");
        assert_eq!(payload["Tags"][0], "tars");

        let check = &payload["Check"];
        assert_eq!(check["GRPC"], "10.0.0.5:17192");
        assert_eq!(check["Interval"], "10s");
        assert_eq!(check["DeregisterCriticalServiceAfter"], "60s");
        assert!(check.get("HTTP").is_none());
        assert!(check.get("TCP").is_none());
    }

    #[test]
    fn test_registration_payload_without_check() {
        let registration = ServiceRegistration::new("user-1", "user", "", 80);
        let payload = ConsulBackend::registration_payload(&registration);
        assert!(payload.get("Check").is_none());
        assert!(payload.get("Address").is_none());
    }

    #[test]
    fn test_health_entry_falls_back_to_node_address() {
        let json = serde_json::json!({
            "Node": { "Node": "node-1", "Address": "192.168.1.10" },
            "Service": { "ID": "user-1", "Service": "user", "Address": "", "Port": 8080, "Tags": null },
            "Checks": [ { "Status": "passing" }, { "Status": "warning" } ]
        });

        let entry: HealthServiceEntry = serde_json::from_value(json).unwrap();
        let entry = ServiceEntry::from(entry);
        assert_eq!(entry.socket_address(), "192.168.1.10:8080");
        assert_eq!(entry.status, HealthStatus::Warning);
        assert!(entry.tags.is_empty());
    }
}

//! Discovery client configuration.

use crate::error::{DiscoveryError, Result};
use crate::service::{CheckKind, CheckTarget, HealthCheckSpec, ServiceRegistration};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Agent address used when none is configured.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";

/// Request timeout used when the configured one is zero.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Long-poll wait per watch iteration.
pub const DEFAULT_WATCH_WAIT: Duration = Duration::from_secs(30);

/// Pause after a failed watch iteration.
pub const DEFAULT_WATCH_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Connection, registration and watch settings for a [`DiscoveryClient`](crate::DiscoveryClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Agent address, `host:port` (or a full URL)
    pub address: String,
    /// `http` or `https`; empty means `http`
    pub scheme: String,
    /// Datacenter to query; agent's own when unset
    pub datacenter: Option<String>,
    /// ACL token
    pub token: Option<String>,
    /// Per-request timeout; zero means 10s
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Name of the service this process registers
    pub service_name: String,
    /// Instance ID; defaults to the service name
    pub service_id: String,
    /// Advertised address of this instance
    pub service_address: String,
    /// Advertised port of this instance
    pub service_port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    pub health_check: Option<HealthCheckConfig>,

    /// Long-poll wait per watch iteration
    #[serde(with = "humantime_serde")]
    pub watch_wait: Duration,
    /// Pause before retrying a failed watch iteration; zero means 1s
    #[serde(with = "humantime_serde")]
    pub watch_retry_backoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            scheme: "http".to_string(),
            datacenter: None,
            token: None,
            timeout: DEFAULT_TIMEOUT,
            service_name: String::new(),
            service_id: String::new(),
            service_address: String::new(),
            service_port: 0,
            tags: Vec::new(),
            meta: HashMap::new(),
            health_check: None,
            watch_wait: DEFAULT_WATCH_WAIT,
            watch_retry_backoff: DEFAULT_WATCH_RETRY_BACKOFF,
        }
    }
}

impl DiscoveryConfig {
    /// Create a configuration pointing at an agent.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the service this process registers.
    pub fn service(
        mut self,
        name: impl Into<String>,
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        self.service_name = name.into();
        self.service_id = id.into();
        self.service_address = address.into();
        self.service_port = port;
        self
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn health_check(mut self, check: HealthCheckConfig) -> Self {
        self.health_check = Some(check);
        self
    }

    /// Set the long-poll wait and the retry backoff used by watches.
    pub fn watch_timing(mut self, wait: Duration, retry_backoff: Duration) -> Self {
        self.watch_wait = wait;
        self.watch_retry_backoff = retry_backoff;
        self
    }

    /// Apply defaults for empty fields and validate the rest.
    pub fn normalized(mut self) -> Result<Self> {
        if self.address.trim().is_empty() {
            self.address = DEFAULT_ADDRESS.to_string();
        }
        if self.scheme.trim().is_empty() {
            self.scheme = "http".to_string();
        }
        self.scheme = self.scheme.trim().to_lowercase();
        if self.scheme != "http" && self.scheme != "https" {
            return Err(DiscoveryError::Config(format!(
                "unsupported scheme: {}",
                self.scheme
            )));
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.watch_wait.is_zero() {
            self.watch_wait = DEFAULT_WATCH_WAIT;
        }
        if self.watch_retry_backoff.is_zero() {
            self.watch_retry_backoff = DEFAULT_WATCH_RETRY_BACKOFF;
        }
        if self.datacenter.as_deref().is_some_and(|dc| dc.trim().is_empty()) {
            self.datacenter = None;
        }
        if self.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.token = None;
        }
        Ok(self)
    }

    /// Base URL of the agent HTTP API.
    pub fn base_url(&self) -> Result<Url> {
        let raw = if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("{}://{}", self.scheme, self.address)
        };

        Url::parse(&raw)
            .map_err(|e| DiscoveryError::Config(format!("invalid address {:?}: {}", raw, e)))
    }

    /// Registration described by this config, or `None` when no service name
    /// is set (discovery/KV-only clients).
    pub fn registration(&self) -> Result<Option<ServiceRegistration>> {
        if self.service_name.trim().is_empty() {
            return Ok(None);
        }

        let id = if self.service_id.trim().is_empty() {
            self.service_name.clone()
        } else {
            self.service_id.clone()
        };

        let mut registration = ServiceRegistration::new(
            id,
            self.service_name.clone(),
            self.service_address.clone(),
            self.service_port,
        );
        registration.tags = self.tags.clone();
        registration.meta = self.meta.clone();
        registration.check = self
            .health_check
            .as_ref()
            .map(HealthCheckConfig::to_spec)
            .transpose()?;

        Ok(Some(registration))
    }
}

/// Health check as written in configuration files.
///
/// `type` selects which of `http`, `tcp` or `grpc` is used as the target; the
/// other two are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub check_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub deregister_critical_service_after: Duration,
    pub http: Option<String>,
    pub tcp: Option<String>,
    pub grpc: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_id: String::new(),
            kind: String::new(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            deregister_critical_service_after: Duration::ZERO,
            http: None,
            tcp: None,
            grpc: None,
        }
    }
}

impl HealthCheckConfig {
    /// Validate and convert into a [`HealthCheckSpec`].
    ///
    /// Unknown types and a missing target for the declared type are rejected.
    pub fn to_spec(&self) -> Result<HealthCheckSpec> {
        let kind: CheckKind = self.kind.parse()?;
        let endpoint = match kind {
            CheckKind::Http => self.http.as_deref(),
            CheckKind::Tcp => self.tcp.as_deref(),
            CheckKind::Grpc => self.grpc.as_deref(),
        }
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            DiscoveryError::Config(format!(
                "health check of type {} requires a `{}` target",
                kind, kind
            ))
        })?;

        Ok(HealthCheckSpec {
            check_id: self.check_id.clone(),
            target: CheckTarget::new(kind, endpoint),
            interval: self.interval,
            timeout: self.timeout,
            deregister_critical_after: self.deregister_critical_service_after,
        })
    }
}

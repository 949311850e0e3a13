//! Service registration and discovered-instance types

use crate::error::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Identity and location of the instance this process publishes.
///
/// Built once at startup and held by the client until shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    /// Service ID (unique per instance)
    pub id: String,

    /// Service name
    pub name: String,

    /// Host/IP address
    pub address: String,

    /// Port number
    pub port: u16,

    /// Service tags
    pub tags: Vec<String>,

    /// Metadata
    pub meta: HashMap<String, String>,

    /// Health check submitted with the registration
    pub check: Option<HealthCheckSpec>,
}

impl ServiceRegistration {
    /// Create new service registration
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            tags: Vec::new(),
            meta: HashMap::new(),
            check: None,
        }
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add metadata
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Attach a health check
    pub fn with_check(mut self, check: HealthCheckSpec) -> Self {
        self.check = Some(check);
        self
    }
}

/// Kind of health check the agent runs against the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Http,
    Tcp,
    Grpc,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Http => "http",
            CheckKind::Tcp => "tcp",
            CheckKind::Grpc => "grpc",
        }
    }
}

impl FromStr for CheckKind {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(CheckKind::Http),
            "tcp" => Ok(CheckKind::Tcp),
            "grpc" => Ok(CheckKind::Grpc),
            other => Err(DiscoveryError::Config(format!(
                "unsupported health check type: {:?} (expected http, tcp or grpc)",
                other
            ))),
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check target; the variant is the check kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckTarget {
    /// URL polled with GET
    Http(String),
    /// `host:port` the agent connects to
    Tcp(String),
    /// gRPC health endpoint, `host:port[/service]`
    Grpc(String),
}

impl CheckTarget {
    /// Build a target from a kind and its endpoint.
    pub fn new(kind: CheckKind, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        match kind {
            CheckKind::Http => CheckTarget::Http(endpoint),
            CheckKind::Tcp => CheckTarget::Tcp(endpoint),
            CheckKind::Grpc => CheckTarget::Grpc(endpoint),
        }
    }

    pub fn kind(&self) -> CheckKind {
        match self {
            CheckTarget::Http(_) => CheckKind::Http,
            CheckTarget::Tcp(_) => CheckKind::Tcp,
            CheckTarget::Grpc(_) => CheckKind::Grpc,
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            CheckTarget::Http(s) | CheckTarget::Tcp(s) | CheckTarget::Grpc(s) => s,
        }
    }
}

/// Health check descriptor sent along with a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    /// Check ID
    pub check_id: String,

    /// What the agent probes
    pub target: CheckTarget,

    /// Interval between probes
    pub interval: Duration,

    /// Per-probe timeout
    pub timeout: Duration,

    /// Remove the instance after it stays critical this long (zero disables)
    pub deregister_critical_after: Duration,
}

impl HealthCheckSpec {
    /// Create a check with 10s interval and 5s timeout
    pub fn new(check_id: impl Into<String>, target: CheckTarget) -> Self {
        Self {
            check_id: check_id.into(),
            target,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            deregister_critical_after: Duration::ZERO,
        }
    }

    pub fn http(check_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(check_id, CheckTarget::Http(url.into()))
    }

    pub fn tcp(check_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(check_id, CheckTarget::Tcp(address.into()))
    }

    pub fn grpc(check_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::new(check_id, CheckTarget::Grpc(endpoint.into()))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn deregister_after(mut self, after: Duration) -> Self {
        self.deregister_critical_after = after;
        self
    }

    pub fn kind(&self) -> CheckKind {
        self.target.kind()
    }
}

/// Aggregated health of a discovered instance.
///
/// Ordered from best to worst so the status of an instance is the maximum over
/// its checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
}

impl HealthStatus {
    /// Parse a Consul check status. Unknown values count as critical.
    pub fn from_consul(status: &str) -> Self {
        match status {
            "passing" => HealthStatus::Passing,
            "warning" => HealthStatus::Warning,
            "maintenance" => HealthStatus::Maintenance,
            _ => HealthStatus::Critical,
        }
    }

    /// Worst status over a set of checks; an instance without checks is passing.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        statuses.into_iter().max().unwrap_or(HealthStatus::Passing)
    }

    pub fn is_passing(&self) -> bool {
        matches!(self, HealthStatus::Passing)
    }
}

/// A discovered service instance. Read-only snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub id: String,
    pub service: String,
    pub node: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub status: HealthStatus,
}

impl ServiceEntry {
    /// `address:port` of the instance
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

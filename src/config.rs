//! Service configuration
//!
//! ```toml
//! [server]
//! app = "tars"
//! server = "user"
//! log_path = "/var/log"
//!
//! [log]
//! level = "info"
//! lifetime = "7days"
//!
//! [consul]
//! address = "127.0.0.1:8500"
//! service_name = "user"
//! service_id = "user-10.0.0.5-17191"
//! service_address = "10.0.0.5"
//! service_port = 17191
//! tags = ["tars"]
//!
//! [consul.health_check]
//! type = "tcp"
//! tcp = "10.0.0.5:17191"
//! interval = "10s"
//! ```
//!
//! Every key can be overridden from the environment, e.g.
//! `USERSVC_CONSUL__ADDRESS=10.0.0.1:8500`.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use usersvc_config::{ConfigManager, ConfigValidator, Validate};
use usersvc_discovery::{DiscoveryClient, DiscoveryConfig, DiscoveryError, HealthCheckConfig};
use usersvc_log::LogConfig;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "USERSVC";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub log: LogConfig,
    /// Registration and discovery; absent means the process runs unregistered
    pub consul: Option<DiscoveryConfig>,
    /// Budget for each shutdown hook
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            log: LogConfig::default(),
            consul: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Process identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub app: String,
    pub server: String,
    /// Root of the `<log_path>/<app>/<server>/` log directory
    pub log_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            app: "usersvc".to_string(),
            server: "user".to_string(),
            log_path: PathBuf::from("logs"),
        }
    }
}

impl AppConfig {
    /// Logging settings placed under `<log_path>/<app>/<server>/`.
    pub fn log_config(&self) -> LogConfig {
        self.log
            .clone()
            .under(&self.server.log_path, &self.server.app, &self.server.server)
    }

    /// Client for the `consul` section.
    ///
    /// Fails with [`DiscoveryError::Config`] when the section is absent.
    pub fn discovery_client(&self) -> usersvc_discovery::Result<DiscoveryClient> {
        let consul = self
            .consul
            .clone()
            .ok_or_else(|| DiscoveryError::Config("no consul section configured".to_string()))?;
        DiscoveryClient::new(consul)
    }

    /// Every optional section filled in, for typing environment overrides.
    fn schema() -> Self {
        Self {
            consul: Some(DiscoveryConfig {
                health_check: Some(HealthCheckConfig::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Copy safe to log: the ACL token is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(consul) = copy.consul.as_mut() {
            if consul.token.is_some() {
                consul.token = Some("***".to_string());
            }
        }
        copy
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> usersvc_config::Result<()> {
        ConfigValidator::not_empty(&self.server.app, "server.app")?;
        ConfigValidator::not_empty(&self.server.server, "server.server")?;

        if let Some(consul) = &self.consul {
            if !consul.scheme.is_empty() {
                let scheme = consul.scheme.to_lowercase();
                ConfigValidator::one_of(&scheme.as_str(), &["http", "https"], "consul.scheme")?;
            }
            if !consul.service_name.trim().is_empty() {
                ConfigValidator::is_port(consul.service_port, "consul.service_port")?;
            }
        }
        Ok(())
    }
}

/// Load configuration: defaults, then `path` (TOML or JSON), then the
/// `.env` file (`env_file`, or `./.env` if present), then `USERSVC_*`
/// environment variables.
///
/// Environment values are typed by field, so `USERSVC_CONSUL__SERVICE_PORT`
/// is read as a number while `USERSVC_CONSUL__TOKEN=123456` stays a string.
pub fn load(path: Option<&Path>, env_file: Option<&Path>) -> Result<AppConfig> {
    let manager = ConfigManager::with_prefix(ENV_PREFIX);
    manager.load_defaults(&AppConfig::default())?;
    manager.load_schema(&AppConfig::schema())?;

    if let Some(path) = path {
        manager.load_file(path)?;
    }
    manager.load_dotenv(env_file)?;

    Ok(manager.load_validated()?)
}

//! Process lifecycle: register, wait, deregister.

use crate::config::AppConfig;
use crate::error::Result;
use crate::shutdown::{ShutdownManager, ShutdownReport, deregistration_hook};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use usersvc_discovery::DiscoveryClient;

/// A configured service process.
pub struct Server {
    config: AppConfig,
    client: Option<DiscoveryClient>,
    shutdown: Arc<ShutdownManager>,
}

impl Server {
    /// Build the process from config, connecting to Consul when a `consul`
    /// section is present.
    pub fn new(config: AppConfig) -> Result<Self> {
        let client = match &config.consul {
            Some(_) => Some(config.discovery_client()?),
            None => None,
        };

        Ok(Self::with_client(config, client))
    }

    /// Build the process around an existing client.
    pub fn with_client(config: AppConfig, client: Option<DiscoveryClient>) -> Self {
        let shutdown = Arc::new(ShutdownManager::new(config.shutdown_timeout));
        Self {
            config,
            client,
            shutdown,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn client(&self) -> Option<&DiscoveryClient> {
        self.client.as_ref()
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// Register this instance and arm deregistration on shutdown.
    pub async fn start(&self) -> Result<()> {
        let Some(client) = &self.client else {
            warn!("No consul section configured; running unregistered");
            return Ok(());
        };

        if client.registration().is_none() {
            info!("Discovery client ready; no service registration configured");
            return Ok(());
        }

        client.register_service().await?;
        self.shutdown
            .add_hook("consul-deregister", deregistration_hook(client.clone()))
            .await;

        Ok(())
    }

    /// Start, wait for `signal`, then shut down.
    ///
    /// Shutdown hooks run even when `signal` fails.
    pub async fn run_until<F>(self, signal: F) -> Result<ShutdownReport>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        self.start().await?;
        info!(
            "{}.{} started",
            self.config.server.app, self.config.server.server
        );

        let waited = signal.await;
        let report = self.shutdown.initiate_shutdown().await;
        waited?;

        info!(
            "{}.{} stopped ({} hooks completed, {} failed, {} timed out)",
            self.config.server.app,
            self.config.server.server,
            report.completed,
            report.failed,
            report.timed_out
        );
        Ok(report)
    }
}

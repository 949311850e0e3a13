//! The discovery client wrapper

use crate::backend::{DiscoveryBackend, QueryOptions};
use crate::config::DiscoveryConfig;
use crate::consul::ConsulBackend;
use crate::error::{BackendError, DiscoveryError, Result};
use crate::service::{ServiceEntry, ServiceRegistration};
use crate::watch::{self, Watch, WatchTiming};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Registers this process, discovers peers and reads/watches KV entries.
///
/// Cloning is cheap; clones share one backend handle.
///
/// # Examples
///
/// ```rust,ignore
/// use usersvc_discovery::{DiscoveryClient, DiscoveryConfig};
/// use tokio_util::sync::CancellationToken;
///
/// let config = DiscoveryConfig::new("127.0.0.1:8500")
///     .service("user", "user-1", "10.0.0.5", 17191);
/// let client = DiscoveryClient::new(config)?;
/// client.register_service().await?;
///
/// let cancel = CancellationToken::new();
/// let mut updates = client.watch_service("order", &cancel);
/// while let Some(instances) = updates.recv().await {
///     println!("order has {} healthy instances", instances.len());
/// }
/// ```
#[derive(Clone)]
pub struct DiscoveryClient {
    backend: Arc<dyn DiscoveryBackend>,
    config: Arc<DiscoveryConfig>,
    registration: Option<Arc<ServiceRegistration>>,
}

impl std::fmt::Debug for DiscoveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("address", &self.config.address)
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

impl DiscoveryClient {
    /// Create a client backed by the Consul agent named in `config`.
    ///
    /// Empty scheme and zero timeout fall back to `http` and 10s. An invalid
    /// config (including a malformed health check) fails with
    /// [`DiscoveryError::Config`]; a handle that cannot be built fails with
    /// [`DiscoveryError::Connection`].
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        let config = config.normalized()?;
        let backend = ConsulBackend::new(&config)?;
        Self::with_backend(config, Arc::new(backend))
    }

    /// Create a client over any backend.
    pub fn with_backend(config: DiscoveryConfig, backend: Arc<dyn DiscoveryBackend>) -> Result<Self> {
        let config = config.normalized()?;
        let registration = config.registration()?.map(Arc::new);

        Ok(Self {
            backend,
            config: Arc::new(config),
            registration,
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// The registration this client publishes, if a service is configured.
    pub fn registration(&self) -> Option<&ServiceRegistration> {
        self.registration.as_deref()
    }

    pub fn backend(&self) -> &Arc<dyn DiscoveryBackend> {
        &self.backend
    }

    fn require_registration(&self) -> Result<&ServiceRegistration> {
        self.registration()
            .ok_or_else(|| DiscoveryError::Config("no service registration configured".to_string()))
    }

    fn timing(&self) -> WatchTiming {
        WatchTiming {
            wait: self.config.watch_wait,
            retry_backoff: self.config.watch_retry_backoff,
        }
    }

    /// Publish this instance (and its health check) to the backend.
    pub async fn register_service(&self) -> Result<()> {
        let registration = self.require_registration()?;

        self.backend
            .register_service(registration)
            .await
            .map_err(DiscoveryError::Registration)?;

        info!(
            "Registered service {} ({}) at {}:{}",
            registration.name, registration.id, registration.address, registration.port
        );
        Ok(())
    }

    /// Remove this instance from the backend.
    ///
    /// An instance the backend does not know about yields
    /// [`DiscoveryError::NotFound`], not a deregistration failure.
    pub async fn deregister_service(&self) -> Result<()> {
        let registration = self.require_registration()?;

        match self.backend.deregister_service(&registration.id).await {
            Ok(()) => {
                info!("Deregistered service {}", registration.id);
                Ok(())
            }
            Err(BackendError::NotFound(what)) => Err(DiscoveryError::NotFound(what)),
            Err(e) => Err(DiscoveryError::Deregistration(e)),
        }
    }

    /// Current instances of `service`, optionally only the healthy ones.
    pub async fn discover_service(&self, service: &str, healthy_only: bool) -> Result<Vec<ServiceEntry>> {
        let (entries, _) = self
            .backend
            .health_service(service, healthy_only, QueryOptions::default())
            .await
            .map_err(DiscoveryError::Discovery)?;

        debug!("Found {} instances of {}", entries.len(), service);
        Ok(entries)
    }

    /// `address:port` of a healthy instance of `service`.
    ///
    /// Always the first instance the backend returns; there is no balancing.
    pub async fn get_service_address(&self, service: &str) -> Result<String> {
        let entries = self.discover_service(service, true).await?;

        entries
            .first()
            .map(ServiceEntry::socket_address)
            .ok_or_else(|| DiscoveryError::NotFound(format!("no healthy service found: {}", service)))
    }

    /// Watch the healthy instances of `service`.
    ///
    /// The first result is the current set; after that a result is delivered
    /// each time the set changes. Runs until `cancel` fires or the handle is
    /// dropped; backend errors are retried.
    pub fn watch_service(&self, service: &str, cancel: &CancellationToken) -> Watch<Vec<ServiceEntry>> {
        let backend = Arc::clone(&self.backend);
        let name = service.to_string();

        watch::spawn(format!("service:{}", service), self.timing(), cancel, move |opts| {
            let backend = Arc::clone(&backend);
            let name = name.clone();
            async move {
                let (entries, meta) = backend.health_service(&name, true, opts).await?;
                Ok::<_, BackendError>((Some(entries), meta))
            }
        })
    }

    /// Read a key. Absent keys fail with [`DiscoveryError::NotFound`].
    pub async fn get_kv(&self, key: &str) -> Result<Vec<u8>> {
        let (entry, _) = self
            .backend
            .kv_get(key, QueryOptions::default())
            .await
            .map_err(|e| DiscoveryError::kv("get", e))?;

        entry
            .map(|entry| entry.value)
            .ok_or_else(|| DiscoveryError::NotFound(format!("key not found: {}", key)))
    }

    /// Write a key.
    pub async fn put_kv(&self, key: &str, value: &[u8]) -> Result<()> {
        let applied = self
            .backend
            .kv_put(key, value)
            .await
            .map_err(|e| DiscoveryError::kv("put", e))?;

        if !applied {
            return Err(DiscoveryError::kv(
                "put",
                BackendError::Unavailable(format!("write to {} was not applied", key)),
            ));
        }
        Ok(())
    }

    /// Delete a key. Deleting an absent key succeeds.
    pub async fn delete_kv(&self, key: &str) -> Result<()> {
        self.backend
            .kv_delete(key)
            .await
            .map_err(|e| DiscoveryError::kv("delete", e))
    }

    /// Watch the payload of `key`.
    ///
    /// Delivers the value each time the key's index changes while it exists;
    /// deletions advance the index but deliver nothing.
    pub fn watch_kv(&self, key: &str, cancel: &CancellationToken) -> Watch<Vec<u8>> {
        let backend = Arc::clone(&self.backend);
        let key_owned = key.to_string();

        watch::spawn(format!("kv:{}", key), self.timing(), cancel, move |opts| {
            let backend = Arc::clone(&backend);
            let key = key_owned.clone();
            async move {
                let (entry, meta) = backend.kv_get(&key, opts).await?;
                Ok::<_, BackendError>((entry.map(|entry| entry.value), meta))
            }
        })
    }

    /// Shutdown hook: deregisters this instance.
    pub async fn close(&self) -> Result<()> {
        self.deregister_service().await
    }
}

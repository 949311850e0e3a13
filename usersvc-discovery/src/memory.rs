//! In-memory discovery backend (for testing)

use crate::backend::{DiscoveryBackend, KvEntry, QueryMeta, QueryOptions, WatchIndex};
use crate::error::BackendError;
use crate::service::{HealthStatus, ServiceEntry, ServiceRegistration};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;

/// Wait applied to blocking queries that set an index but no wait time.
const DEFAULT_BLOCKING_WAIT: Duration = Duration::from_secs(300);

#[derive(Default)]
struct State {
    /// Global modify counter; every mutation takes the next value.
    index: u64,
    services: HashMap<String, (ServiceRegistration, HealthStatus)>,
    /// Last modify index per service name. Kept after deregistration.
    service_index: HashMap<String, u64>,
    kv: HashMap<String, KvEntry>,
    /// Last modify index per key. Kept after deletion.
    kv_index: HashMap<String, u64>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn touch_service(&mut self, name: &str) -> u64 {
        let index = self.bump();
        self.service_index.insert(name.to_string(), index);
        index
    }

    fn service_index(&self, name: &str) -> u64 {
        self.service_index.get(name).copied().unwrap_or(0)
    }

    fn kv_index(&self, key: &str) -> u64 {
        self.kv_index.get(key).copied().unwrap_or(0)
    }
}

/// Process-local registry and KV store with Consul-style blocking queries.
///
/// Each service name and each key carries its own change index, so a query
/// blocked on one resource only wakes when that resource changes. Instances
/// register as passing; use [`set_health`](Self::set_health) to change that.
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<RwLock<State>>,
    changes: Arc<watch::Sender<u64>>,
    failures: Arc<AtomicUsize>,
}

impl InMemoryBackend {
    /// Create new in-memory backend
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(RwLock::new(State::default())),
            changes: Arc::new(changes),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `count` calls fail with [`BackendError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Set the health status of a registered instance.
    pub async fn set_health(&self, service_id: &str, status: HealthStatus) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        let name = match state.services.get_mut(service_id) {
            Some((registration, current)) => {
                *current = status;
                registration.name.clone()
            }
            None => return Err(BackendError::NotFound(format!("service ID {}", service_id))),
        };
        let index = state.touch_service(&name);
        drop(state);

        self.changes.send_replace(index);
        Ok(())
    }

    /// Current global modify index.
    pub async fn index(&self) -> u64 {
        self.state.read().await.index
    }

    /// Get count of registered instances
    pub async fn count(&self) -> usize {
        self.state.read().await.services.len()
    }

    fn take_failure(&self) -> Result<(), BackendError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if injected {
            Err(BackendError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    /// Run `read` against the state, blocking while the resource index reported
    /// by `read` equals the requested wait index.
    async fn blocking_read<T, F>(&self, opts: QueryOptions, read: F) -> (T, QueryMeta)
    where
        F: Fn(&State) -> (T, u64),
    {
        let deadline = Instant::now() + opts.wait_time.unwrap_or(DEFAULT_BLOCKING_WAIT);
        let mut changes = self.changes.subscribe();

        loop {
            let (value, index) = read(&*self.state.read().await);
            let meta = QueryMeta {
                last_index: WatchIndex::new(index),
            };

            match opts.wait_index {
                Some(wait) if wait.get() == index => {}
                _ => return (value, meta),
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                // deadline reached, or the sender is gone
                _ => return (value, meta),
            }
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryBackend for InMemoryBackend {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<(), BackendError> {
        self.take_failure()?;

        let mut state = self.state.write().await;
        // re-registering an instance replaces it, including a rename
        if let Some((previous, _)) = state.services.remove(&registration.id) {
            if previous.name != registration.name {
                state.touch_service(&previous.name);
            }
        }
        state
            .services
            .insert(registration.id.clone(), (registration.clone(), HealthStatus::Passing));
        let index = state.touch_service(&registration.name);
        drop(state);

        self.changes.send_replace(index);
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), BackendError> {
        self.take_failure()?;

        let mut state = self.state.write().await;
        let (registration, _) = state
            .services
            .remove(service_id)
            .ok_or_else(|| BackendError::NotFound(format!("service ID {}", service_id)))?;
        let index = state.touch_service(&registration.name);
        drop(state);

        self.changes.send_replace(index);
        Ok(())
    }

    async fn health_service(
        &self,
        service: &str,
        passing_only: bool,
        opts: QueryOptions,
    ) -> Result<(Vec<ServiceEntry>, QueryMeta), BackendError> {
        self.take_failure()?;

        let result = self
            .blocking_read(opts, |state| {
                let mut entries: Vec<ServiceEntry> = state
                    .services
                    .values()
                    .filter(|(registration, _)| registration.name == service)
                    .filter(|(_, status)| !passing_only || status.is_passing())
                    .map(|(registration, status)| ServiceEntry {
                        id: registration.id.clone(),
                        service: registration.name.clone(),
                        node: "memory".to_string(),
                        address: registration.address.clone(),
                        port: registration.port,
                        tags: registration.tags.clone(),
                        status: *status,
                    })
                    .collect();
                entries.sort_by(|a, b| a.id.cmp(&b.id));
                (entries, state.service_index(service))
            })
            .await;

        Ok(result)
    }

    async fn kv_get(
        &self,
        key: &str,
        opts: QueryOptions,
    ) -> Result<(Option<KvEntry>, QueryMeta), BackendError> {
        self.take_failure()?;

        let result = self
            .blocking_read(opts, |state| (state.kv.get(key).cloned(), state.kv_index(key)))
            .await;

        Ok(result)
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<bool, BackendError> {
        self.take_failure()?;

        let mut state = self.state.write().await;
        let index = state.bump();
        state.kv_index.insert(key.to_string(), index);
        state.kv.insert(
            key.to_string(),
            KvEntry {
                key: key.to_string(),
                value: value.to_vec(),
                modify_index: WatchIndex::new(index),
            },
        );
        drop(state);

        self.changes.send_replace(index);
        Ok(true)
    }

    async fn kv_delete(&self, key: &str) -> Result<(), BackendError> {
        self.take_failure()?;

        let mut state = self.state.write().await;
        if state.kv.remove(key).is_none() {
            return Ok(());
        }
        let index = state.bump();
        state.kv_index.insert(key.to_string(), index);
        drop(state);

        self.changes.send_replace(index);
        Ok(())
    }
}

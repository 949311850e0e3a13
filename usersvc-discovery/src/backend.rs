//! Discovery backend seam
//!
//! [`DiscoveryClient`](crate::DiscoveryClient) talks to the registry only
//! through [`DiscoveryBackend`], so tests and embedders can swap the Consul
//! agent for [`InMemoryBackend`](crate::InMemoryBackend) or their own fake.

use crate::error::BackendError;
use crate::service::{ServiceEntry, ServiceRegistration};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Opaque change marker reported by the backend for a watched resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchIndex(u64);

impl WatchIndex {
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Record a reported index. Returns true when it differs from the last one
    /// seen, which is the only case in which a watch emits.
    pub fn observe(&mut self, reported: WatchIndex) -> bool {
        if reported == *self {
            return false;
        }
        *self = reported;
        true
    }
}

impl fmt::Display for WatchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Blocking-query parameters.
///
/// A query with `wait_index` set blocks until the resource's index moves past
/// it or `wait_time` elapses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub wait_index: Option<WatchIndex>,
    pub wait_time: Option<Duration>,
}

impl QueryOptions {
    pub fn blocking(wait_index: WatchIndex, wait_time: Duration) -> Self {
        Self {
            wait_index: Some(wait_index),
            wait_time: Some(wait_time),
        }
    }
}

/// Metadata returned with every query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMeta {
    pub last_index: WatchIndex,
}

/// A key with its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub modify_index: WatchIndex,
}

/// Registry and KV operations a discovery backend must provide.
///
/// Implementations must be safe for concurrent use: one client and any number
/// of watch tasks share a single backend.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Publish an instance (and its check) to the local agent.
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<(), BackendError>;

    /// Remove an instance. Unknown IDs yield [`BackendError::NotFound`].
    async fn deregister_service(&self, service_id: &str) -> Result<(), BackendError>;

    /// Instances of `service`, optionally only those whose checks all pass.
    async fn health_service(
        &self,
        service: &str,
        passing_only: bool,
        opts: QueryOptions,
    ) -> Result<(Vec<ServiceEntry>, QueryMeta), BackendError>;

    /// Read one key. An absent key is `Ok((None, meta))`.
    async fn kv_get(
        &self,
        key: &str,
        opts: QueryOptions,
    ) -> Result<(Option<KvEntry>, QueryMeta), BackendError>;

    /// Write one key. Returns whether the write was applied.
    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<bool, BackendError>;

    /// Delete one key. Deleting an absent key succeeds.
    async fn kv_delete(&self, key: &str) -> Result<(), BackendError>;
}

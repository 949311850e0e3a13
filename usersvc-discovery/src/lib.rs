//! Service discovery for usersvc
//!
//! A thin client over a Consul-style registry: publish this process, find
//! peers, read and write small KV values, and long-poll watch either.
//!
//! ## Features
//!
//! - **Service Registration** - Register and deregister this instance, with an HTTP, TCP or gRPC health check
//! - **Service Discovery** - List instances of a service, all or healthy only
//! - **Key-Value** - Get, put and delete single keys
//! - **Watches** - Long-poll loops that deliver only on change-index movement and retry backend errors forever
//! - **Pluggable Backends** - Consul over HTTP, or in-memory for tests
//!
//! ## Quick Start
//!
//! ### Consul
//!
//! ```rust,ignore
//! use usersvc_discovery::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DiscoveryConfig::new("127.0.0.1:8500")
//!         .service("user", "user-1", "10.0.0.5", 17191)
//!         .health_check(HealthCheckConfig {
//!             kind: "tcp".into(),
//!             tcp: Some("10.0.0.5:17191".into()),
//!             ..Default::default()
//!         });
//!
//!     let client = DiscoveryClient::new(config)?;
//!     client.register_service().await?;
//!
//!     let addr = client.get_service_address("order").await?;
//!     println!("order at {}", addr);
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### In-Memory (Testing)
//!
//! ```
//! use std::sync::Arc;
//! use usersvc_discovery::*;
//!
//! # tokio_test::block_on(async {
//! let backend = InMemoryBackend::new();
//! let client = DiscoveryClient::with_backend(DiscoveryConfig::default(), Arc::new(backend))?;
//!
//! client.put_kv("feature/flags", b"on").await?;
//! assert_eq!(client.get_kv("feature/flags").await?, b"on");
//! # Ok::<(), DiscoveryError>(())
//! # }).unwrap();
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod consul;
pub mod error;
pub mod memory;
pub mod service;
pub mod watch;

pub use backend::{DiscoveryBackend, KvEntry, QueryMeta, QueryOptions, WatchIndex};
pub use client::DiscoveryClient;
pub use config::{DiscoveryConfig, HealthCheckConfig};
pub use consul::ConsulBackend;
pub use error::{BackendError, DiscoveryError, Result};
pub use memory::InMemoryBackend;
pub use service::{
    CheckKind, CheckTarget, HealthCheckSpec, HealthStatus, ServiceEntry, ServiceRegistration,
};
pub use watch::{Watch, WatchStats, WatchTiming};

pub use tokio_util::sync::CancellationToken;

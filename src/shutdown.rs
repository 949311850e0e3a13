//! Graceful shutdown
//!
//! A [`ShutdownManager`] holds named async hooks and runs them in
//! registration order once shutdown starts, each bounded by a timeout. It
//! also owns a [`CancellationToken`] that is cancelled first, so watches
//! created from [`ShutdownManager::token`] stop before the hooks run.
//!
//! ```no_run
//! use std::sync::Arc;
//! use usersvc::shutdown::*;
//!
//! # async fn example(client: usersvc::discovery::DiscoveryClient) -> usersvc::Result<()> {
//! let manager = Arc::new(ShutdownManager::default());
//! manager.add_hook("deregister", deregistration_hook(client)).await;
//!
//! wait_for_signal().await?;
//! manager.initiate_shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::error::AppError;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use usersvc_discovery::DiscoveryClient;

/// Shutdown hook function type
///
/// Async function that performs cleanup during shutdown.
pub type ShutdownHook =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send>> + Send + Sync>;

/// Outcome of running the shutdown hooks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.timed_out == 0
    }
}

/// Shutdown manager coordinates graceful shutdown
pub struct ShutdownManager {
    hooks: RwLock<Vec<(String, ShutdownHook)>>,
    shutdown_initiated: AtomicBool,
    /// Budget per hook
    timeout: Duration,
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            shutdown_initiated: AtomicBool::new(false),
            timeout,
            token: CancellationToken::new(),
        }
    }

    /// Register a shutdown hook
    ///
    /// Hooks are executed in registration order during shutdown.
    pub async fn add_hook(&self, name: impl Into<String>, hook: ShutdownHook) {
        let mut hooks = self.hooks.write().await;
        hooks.push((name.into(), hook));
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Cancel the token, then run every hook.
    ///
    /// Hook failures and timeouts are logged and counted; they never stop
    /// later hooks. A second call does nothing and returns an empty report.
    pub async fn initiate_shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already initiated");
            return report;
        }

        info!("Initiating graceful shutdown...");
        self.token.cancel();

        let hooks = self.hooks.read().await;
        for (name, hook) in hooks.iter() {
            match timeout(self.timeout, hook()).await {
                Ok(Ok(())) => {
                    info!("Shutdown hook {} completed successfully", name);
                    report.completed += 1;
                }
                Ok(Err(e)) => {
                    error!("Shutdown hook {} failed: {}", name, e);
                    report.failed += 1;
                }
                Err(_) => {
                    error!("Shutdown hook {} timed out after {:?}", name, self.timeout);
                    report.timed_out += 1;
                }
            }
        }

        info!("Graceful shutdown complete");
        report
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Hook that deregisters `client`'s instance.
///
/// An instance the registry no longer knows is treated as done.
pub fn deregistration_hook(client: DiscoveryClient) -> ShutdownHook {
    Box::new(move || {
        let client = client.clone();
        Box::pin(async move {
            match client.close().await {
                Ok(()) => {
                    info!("Consul deregistration successful");
                    Ok(())
                }
                Err(e) if e.is_not_found() => {
                    info!("Service already deregistered: {}", e);
                    Ok(())
                }
                Err(e) => Err(AppError::from(e)),
            }
        })
    })
}

/// Resolve on SIGINT or SIGTERM (Ctrl-C only off Unix).
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    info!("Shutdown signal received, starting graceful shutdown...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn recording_hook(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> ShutdownHook {
        Box::new(move || {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(name);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_hooks_run_in_order() {
        let manager = ShutdownManager::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        manager.add_hook("first", recording_hook("first", log.clone())).await;
        manager.add_hook("second", recording_hook("second", log.clone())).await;

        let report = manager.initiate_shutdown().await;
        assert_eq!(report.completed, 2);
        assert!(report.is_clean());
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_hooks() {
        let manager = ShutdownManager::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        manager
            .add_hook(
                "broken",
                Box::new(|| {
                    Box::pin(async {
                        Err::<(), _>(AppError::Signal(std::io::Error::other("boom")))
                    })
                }),
            )
            .await;
        manager.add_hook("after", recording_hook("after", log.clone())).await;

        let report = manager.initiate_shutdown().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_timeout() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        manager
            .add_hook(
                "stuck",
                Box::new(|| Box::pin(std::future::pending::<Result<(), AppError>>())),
            )
            .await;

        let report = manager.initiate_shutdown().await;
        assert_eq!(report.timed_out, 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_token_cancelled_and_second_call_is_noop() {
        let manager = ShutdownManager::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.add_hook("once", recording_hook("once", log.clone())).await;

        let token = manager.token();
        assert!(!manager.is_shutting_down());

        manager.initiate_shutdown().await;
        assert!(token.is_cancelled());
        assert!(manager.is_shutting_down());

        let report = manager.initiate_shutdown().await;
        assert_eq!(report, ShutdownReport::default());
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}

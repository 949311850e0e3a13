// usersvc - user service process wiring
//
// Loads layered configuration, installs file logging under
// `<log_path>/<app>/<server>/`, registers the instance with Consul and
// deregisters it on SIGINT/SIGTERM.

pub mod config;
pub mod error;
pub mod server;
pub mod shutdown;

pub use error::{AppError, Result};

// Re-export member crates
pub use usersvc_config as config_loader;
pub use usersvc_discovery as discovery;
pub use usersvc_log as log;

// Prelude for common imports
pub mod prelude {
    pub use crate::config::{AppConfig, ServerConfig};
    pub use crate::server::Server;
    pub use crate::shutdown::{ShutdownManager, ShutdownReport, deregistration_hook, wait_for_signal};
    pub use crate::{AppError, Result};
    pub use usersvc_discovery::{
        CancellationToken, DiscoveryClient, DiscoveryConfig, DiscoveryError, HealthCheckConfig,
        ServiceEntry,
    };
    pub use usersvc_log::{LogConfig, LogGuard};
}

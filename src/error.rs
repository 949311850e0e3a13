//! Process-level errors.

use thiserror::Error;
use usersvc_config::ConfigError;
use usersvc_discovery::DiscoveryError;
use usersvc_log::LogError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Log(#[from] LogError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

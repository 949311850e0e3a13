//! usersvc-server
//!
//! Run with: usersvc-server --config conf/usersvc.toml

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use usersvc::config;
use usersvc::prelude::*;

/// User service
#[derive(Parser)]
#[command(name = "usersvc-server")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(about = "User service: registers with Consul and deregisters on shutdown")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, env = "USERSVC_CONFIG")]
    config: Option<PathBuf>,

    /// Additional .env file to load before the environment
    #[arg(long)]
    env_file: Option<PathBuf>,
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::load(cli.config.as_deref(), cli.env_file.as_deref())?;

    let _guard = config.log_config().init()?;
    info!(
        config = %serde_json::to_string(&config.redacted()).unwrap_or_default(),
        "Loaded configuration"
    );

    let server = Server::new(config)?;
    server.run_until(wait_for_signal()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // logging may not be up yet
            eprintln!("usersvc-server: {}", e);
            error!("Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

//! ceems-lb - tenant-aware load balancer for CEEMS metric backends

use ceems_lb::config::LbConfig;
use ceems_lb::server::{self, AppState};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Tenant-aware load balancer for CEEMS metric backends
#[derive(Debug, Parser)]
#[command(name = "ceems-lb")]
#[command(about = "Tenant-aware load balancer for CEEMS metric backends")]
#[command(version)]
struct Options {
    /// Configuration file path
    #[arg(long = "config.file", value_name = "FILE")]
    config_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log.level", default_value = "info")]
    log_level: String,

    /// Address to listen on for incoming requests
    #[arg(long = "web.listen-address", default_value = ":9030")]
    listen_address: String,
}

/// Accept `:9030` shorthand for all-interfaces binds.
fn normalize_listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let options = Options::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&options.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config: LbConfig = match ceems_core::load_config(&options.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %options.config_file.display(), error = %e, "cannot load configuration");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::from(1);
    }
    info!(path = %options.config_file.display(), "loaded configuration");

    let state = match AppState::from_config(&config) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "cannot initialize gateway");
            return ExitCode::from(1);
        }
    };

    let health_handles = match state.start_health_checks(&config) {
        Ok(handles) => handles,
        Err(e) => {
            error!(error = %e, "cannot start health checks");
            return ExitCode::from(1);
        }
    };

    let address = normalize_listen_address(&options.listen_address);
    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %address, error = %e, "cannot bind listen address");
            return ExitCode::from(2);
        }
    };

    let result = server::serve(listener, state).await;
    for handle in health_handles {
        handle.abort();
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::from(1)
        }
    }
}

//! `vsock-proxy` — control plane for the TCP ↔ vsock bridge daemon.
//!
//! Startup sequence:
//! 1. Parse the command line; `-h` and `-c` answer immediately.
//! 2. Resolve [`Config`](config::Config) from `VSOCK_*` and the config file.
//! 3. Initialise structured JSON logging.
//! 4. Dispatch the action through the [`ServiceController`], which for the run
//!    modes builds the tuples and serves them until told to stop.

mod cli;
mod config;
mod context;
mod proxy;
mod service;
mod signals;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use cli::Cli;
use config::ConfigStore;
use context::ProcessContext;
use proxy::Proxy;
use service::{ServiceController, ServiceDescriptor, ServiceManager, SystemdManager};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Command line
    // -----------------------------------------------------------------------
    let cli = Cli::parse();
    if cli.help {
        println!("{}", cli::help_text());
        return Ok(());
    }
    if cli.cid {
        println!("{}", common::cid::describe(common::cid::local_cid()));
        return Ok(());
    }

    // -----------------------------------------------------------------------
    // 2. Configuration
    // -----------------------------------------------------------------------
    let loaded = ConfigStore::discover()
        .load(cli.action.persists_config())
        .map_err(|e| {
            // Telemetry is not yet up; write to stderr directly.
            eprintln!("ERROR: vsock-proxy configuration invalid: {e:#}");
            e
        })?;

    // -----------------------------------------------------------------------
    // 3. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&loaded.config.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        action = %cli.action,
        "vsock-proxy starting"
    );
    loaded.log();

    // -----------------------------------------------------------------------
    // 4. Lifecycle
    // -----------------------------------------------------------------------
    let manager = SystemdManager::new(ServiceDescriptor::vsock_proxy());
    let ctx = ProcessContext::new(manager.logger());
    let controller = ServiceController::new(manager, Proxy, ctx, loaded.config);

    controller.dispatch(cli.action).await.map_err(|e| {
        error!(action = %cli.action, error = %format!("{e:#}"), "fatal");
        e
    })
}

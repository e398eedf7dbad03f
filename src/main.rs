//! tether — remote-controlled agent

use clap::Parser;
use std::sync::Arc;
use tether::{Agent, Cli, HostCapabilities, NoPermissionModel, TcpConnector};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("tether=debug")
    } else {
        EnvFilter::new("tether=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.agent_config();
    let connector = TcpConnector::new(config.connect_timeout);
    let agent = Agent::new(
        config,
        connector,
        Arc::new(HostCapabilities::new()),
        Arc::new(NoPermissionModel),
    );
    let mut handle = agent.start();

    // Foreground: show the status line until interrupted.
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    println!("{}", handle.status());
    loop {
        tokio::select! {
            status = handle.next_status() => {
                if let Some(status) = status {
                    println!("{status}");
                } else {
                    error!("Supervisor stopped unexpectedly");
                    std::process::exit(1);
                }
            }
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    handle.abort();
}

//! tedge-container
//!
//! Container software management plugin and monitoring service for
//! thin-edge.io.
//!
//! Logs go to stderr: the plugin protocol uses stdout for `list` output.

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tedge_container_agent::commands::Cli;
use tedge_container_agent::error::{exit_code_for, is_silent, EXIT_FAILURE};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(EXIT_FAILURE);
        }
    };

    init_tracing(cli.log_level(&config), cli.json_logs());

    if let Err(e) = cli.run(config).await {
        if !is_silent(&e) {
            error!(error = %format!("{:#}", e), "Command failed");
        }
        std::process::exit(exit_code_for(&e));
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

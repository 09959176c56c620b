//! CLI commands.

mod container;
mod group;
mod run;
mod self_update;
mod tools;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::engine::docker::DockerEngine;
use crate::engine::ContainerEngine;
use crate::orchestrator::{PullPolicy, RegistryCredentials};

/// Container software management for thin-edge.io.
#[derive(Debug, Parser)]
#[command(name = "tedge-container")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file.
    #[arg(short, long, global = true, env = "CONTAINER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format (text or json).
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the container monitor and reconciliation service.
    Run(run::RunCommand),

    /// Software management plugin for single containers.
    Container(container::ContainerCommand),

    /// Software management plugin for compose projects.
    ContainerGroup(group::GroupCommand),

    /// Software management plugin for the agent's own container.
    #[command(name = "self", hide = true)]
    SelfUpdate(self_update::SelfCommand),

    /// Container maintenance tools.
    Tools(tools::ToolsCommand),
}

impl Cli {
    /// Load the configuration named by `--config` (or the default locations).
    pub fn load_config(&self) -> Result<Config> {
        Config::load(self.config.as_deref()).context("failed to load configuration")
    }

    /// Log filter directive: the flag, else the configured level.
    pub fn log_level<'a>(&'a self, config: &'a Config) -> &'a str {
        self.log_level.as_deref().unwrap_or(&config.log_level)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    /// Run the command.
    pub async fn run(self, config: Config) -> Result<()> {
        let ctx = CommandContext { config };

        match self.command {
            Commands::Run(cmd) => cmd.run(ctx).await,
            Commands::Container(cmd) => cmd.run(ctx).await,
            Commands::ContainerGroup(cmd) => cmd.run(ctx).await,
            Commands::SelfUpdate(cmd) => cmd.run(ctx).await,
            Commands::Tools(cmd) => cmd.run(ctx).await,
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: Config,
}

impl CommandContext {
    /// Connect to the container engine.
    pub fn engine(&self) -> Result<Arc<dyn ContainerEngine>> {
        let engine = DockerEngine::connect().context("failed to connect to the container engine")?;
        Ok(Arc::new(engine))
    }

    /// Registry credentials from the configured file and helper script.
    pub fn credentials(&self) -> Arc<RegistryCredentials> {
        Arc::new(RegistryCredentials::new(&self.config.registry))
    }

    pub fn pull_policy(&self) -> PullPolicy {
        PullPolicy {
            always_pull: self.config.container.always_pull,
            ..PullPolicy::default()
        }
    }
}

/// Print one `name<TAB>version` line per module, as the plugin protocol expects.
fn print_modules(modules: &[(String, String)]) {
    for (name, version) in modules {
        println!("{}\t{}", name, version);
    }
}

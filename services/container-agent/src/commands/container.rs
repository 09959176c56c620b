//! `container` software management plugin.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tracing::info;

use crate::engine::FilterSpec;
use crate::error::AgentError;
use crate::orchestrator::compose::DEFAULT_VERSION;
use crate::orchestrator::packages::ContainerPackages;

use super::{print_modules, CommandContext};

/// Single containers as software modules: the module name is the container
/// name and the module version is the image.
#[derive(Debug, Args)]
pub struct ContainerCommand {
    #[command(subcommand)]
    command: ContainerSubcommand,
}

#[derive(Debug, Subcommand)]
enum ContainerSubcommand {
    /// Prepare a sequence of install/remove commands.
    Prepare,

    /// Install (or replace) a container.
    Install(InstallArgs),

    /// Stop and remove a container.
    Remove(RemoveArgs),

    /// List installed containers.
    List,

    /// Finalize a sequence of install/remove commands.
    Finalize,

    /// Update a list of modules in one go (not supported).
    UpdateList,
}

#[derive(Debug, Args)]
pub(super) struct InstallArgs {
    /// Module name.
    pub name: String,

    /// Module version: the image to run. Defaults to `latest`.
    #[arg(long)]
    pub module_version: Option<String>,

    /// Module file.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub(super) struct RemoveArgs {
    /// Module name.
    pub name: String,

    /// Module version.
    #[arg(long)]
    pub module_version: Option<String>,
}

impl InstallArgs {
    /// The image to install. Only an image file can stand in for a missing
    /// version.
    fn image(&self) -> Result<&str, AgentError> {
        match (&self.module_version, &self.file) {
            (Some(version), _) => Ok(version),
            (None, Some(_)) => Ok(DEFAULT_VERSION),
            (None, None) => Err(AgentError::Config(
                "--module-version is required when no --file is given".to_string(),
            )),
        }
    }
}

impl ContainerCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            ContainerSubcommand::Prepare => Ok(()),
            ContainerSubcommand::UpdateList => {
                Err(AgentError::Unsupported("update-list".to_string()).into())
            }
            ContainerSubcommand::Install(args) => {
                let image = args.image()?;
                let packages = packages(&ctx)?;
                let id = packages
                    .install(&args.name, image, args.file.as_deref())
                    .await
                    .with_context(|| format!("failed to install container '{}'", args.name))?;
                info!(name = %args.name, id = %id, "Installed container");
                Ok(())
            }
            ContainerSubcommand::Remove(args) => {
                packages(&ctx)?
                    .remove(&args.name)
                    .await
                    .with_context(|| format!("failed to remove container '{}'", args.name))?;
                Ok(())
            }
            ContainerSubcommand::List => {
                let filter = FilterSpec {
                    exclude_with_label: ctx.config.filter.exclude.labels.clone(),
                    ..FilterSpec::default()
                };
                let modules = packages(&ctx)?.list(&filter).await?;
                print_modules(&modules);
                Ok(())
            }
            ContainerSubcommand::Finalize => {
                packages(&ctx)?
                    .finalize(ctx.config.container.prune_images)
                    .await?;
                Ok(())
            }
        }
    }
}

fn packages(ctx: &CommandContext) -> Result<ContainerPackages> {
    Ok(ContainerPackages::new(ctx.engine()?)
        .with_credentials(ctx.credentials())
        .with_pull_policy(ctx.pull_policy())
        .with_network(&ctx.config.container.network))
}

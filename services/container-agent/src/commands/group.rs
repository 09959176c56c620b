//! `container-group` software management plugin.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tedge_container_cmdbuilder::{detect, ProcessProber};
use tracing::info;

use crate::engine::ContainerEngine;
use crate::error::AgentError;
use crate::orchestrator::compose::{list_projects, ComposeProjects, DEFAULT_VERSION};
use crate::orchestrator::packages::ContainerPackages;

use super::container::RemoveArgs;
use super::{print_modules, CommandContext};

/// Compose projects as software modules. The module file is a compose file
/// or a tar(.gz) bundle containing one.
#[derive(Debug, Args)]
pub struct GroupCommand {
    #[command(subcommand)]
    command: GroupSubcommand,
}

#[derive(Debug, Subcommand)]
enum GroupSubcommand {
    /// Prepare a sequence of install/remove commands.
    Prepare,

    /// Install (or replace) a compose project.
    Install(GroupInstallArgs),

    /// Take a compose project down and delete its files.
    Remove(RemoveArgs),

    /// List installed compose projects.
    List,

    /// Finalize a sequence of install/remove commands.
    Finalize,

    /// Update a list of modules in one go (not supported).
    UpdateList,
}

#[derive(Debug, Args)]
struct GroupInstallArgs {
    /// Project name.
    name: String,

    /// Module version, stored with the project.
    #[arg(long, default_value = DEFAULT_VERSION)]
    module_version: String,

    /// Compose file or bundle.
    #[arg(long)]
    file: PathBuf,
}

impl GroupCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            GroupSubcommand::Prepare => Ok(()),
            GroupSubcommand::UpdateList => {
                Err(AgentError::Unsupported("update-list".to_string()).into())
            }
            GroupSubcommand::Install(args) => {
                let projects = projects(&ctx).await?;
                projects
                    .install(&args.name, &args.module_version, &args.file)
                    .await
                    .with_context(|| format!("failed to install project '{}'", args.name))?;
                info!(project = %args.name, version = %args.module_version, "Installed project");
                Ok(())
            }
            GroupSubcommand::Remove(args) => {
                let projects = projects(&ctx).await?;
                projects
                    .remove(&args.name)
                    .await
                    .with_context(|| format!("failed to remove project '{}'", args.name))?;
                Ok(())
            }
            GroupSubcommand::List => {
                let engine = ctx.engine()?;
                let root = compose_root(&ctx, false)?;
                let modules = list_projects(engine.as_ref(), &root).await?;
                print_modules(&modules);
                Ok(())
            }
            GroupSubcommand::Finalize => {
                ContainerPackages::new(ctx.engine()?)
                    .finalize(ctx.config.container.prune_images)
                    .await?;
                Ok(())
            }
        }
    }
}

/// `<persistent dir>/compose`.
fn compose_root(ctx: &CommandContext, check_writable: bool) -> Result<PathBuf> {
    let dir = ctx
        .config
        .persistent_dir(check_writable)
        .context("no usable data directory")?;
    Ok(dir.join("compose"))
}

/// Resolve the compose backend before anything is changed.
async fn projects(ctx: &CommandContext) -> Result<ComposeProjects> {
    let command = detect(&ProcessProber).await.map_err(AgentError::from)?;
    info!(program = %command.base.program(), version = %command.version, "Using compose backend");

    let engine: Arc<dyn ContainerEngine> = ctx.engine()?;
    let root = compose_root(ctx, true)?;
    ensure_dir(&root)?;

    Ok(ComposeProjects::new(engine, command, root)?
        .with_credentials(ctx.credentials())
        .with_pull_policy(ctx.pull_policy())
        .with_network(&ctx.config.container.network))
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(subcommand)]
        command: GroupSubcommand,
    }

    fn install(args: &[&str]) -> GroupInstallArgs {
        let argv = ["container-group", "install"].into_iter().chain(args.iter().copied());
        match Harness::parse_from(argv).command {
            GroupSubcommand::Install(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_install_version_defaults_to_latest() {
        let args = install(&["shop", "--file", "/tmp/docker-compose.yaml"]);
        assert_eq!(args.name, "shop");
        assert_eq!(args.module_version, "latest");
    }

    #[test]
    fn test_install_with_version() {
        let args = install(&["shop", "--module-version", "1.2.3", "--file", "shop.tar.gz"]);
        assert_eq!(args.module_version, "1.2.3");
        assert_eq!(args.file, PathBuf::from("shop.tar.gz"));
    }
}

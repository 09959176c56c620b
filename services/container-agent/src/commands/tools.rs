//! Container maintenance tools.

use std::time::Duration;

use anyhow::Result;
use clap::{Args, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

use crate::engine::{self, ContainerEngine, LogOptions};
use crate::error::AgentError;
use crate::orchestrator::{
    local_hostname, resolve_self, CloneSpec, Orchestrator, UpdateOutcome, UpdateRequest,
};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct ToolsCommand {
    #[command(subcommand)]
    command: ToolsSubcommand,
}

#[derive(Debug, Subcommand)]
enum ToolsSubcommand {
    /// Replace a container with a clone, optionally using a new image.
    ContainerClone(CloneArgs),

    /// Stop and remove containers.
    ContainerRemove(ContainerRemoveArgs),

    /// Restart containers. Defaults to the current container.
    ContainerRestart(ContainerRestartArgs),

    /// Print container logs. Defaults to the current container.
    ContainerLogs(ContainerLogsArgs),
}

#[derive(Debug, Args)]
struct CloneArgs {
    /// Container to clone, by id or name. Defaults to the current container.
    #[arg(long)]
    container: Option<String>,

    /// Image of the clone. Defaults to the image of the container.
    #[arg(long)]
    image: Option<String>,

    /// How long the clone has to become healthy.
    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// How long to wait for the container to stop (with --wait-for-exit).
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    stop_timeout: Duration,

    /// Stop the original this long after the update started.
    #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
    stop_after: Duration,

    /// Remove the clone when it exits.
    #[arg(long = "rm")]
    auto_remove: bool,

    /// Extra host entries (host:ip).
    #[arg(long = "add-host", value_delimiter = ',')]
    add_host: Vec<String>,

    /// Extra environment variables (KEY=VALUE).
    #[arg(short, long, value_delimiter = ',')]
    env: Vec<String>,

    /// Update even when the image did not change.
    #[arg(long)]
    force: bool,

    /// Hand the update to a helper container.
    #[arg(long)]
    fork: bool,

    /// Wait for the container to exit before updating.
    #[arg(long)]
    wait_for_exit: bool,

    /// Only check whether an update is needed.
    #[arg(long)]
    check: bool,

    /// Drop port bindings so the clone can start next to the original.
    #[arg(long = "ignore-ports")]
    ignore_ports: bool,
}

#[derive(Debug, Args)]
struct ContainerRemoveArgs {
    /// Container ids or names.
    #[arg(required = true)]
    containers: Vec<String>,
}

#[derive(Debug, Args)]
struct ContainerRestartArgs {
    /// Container ids or names.
    containers: Vec<String>,
}

#[derive(Debug, Args)]
struct ContainerLogsArgs {
    /// Container ids or names.
    containers: Vec<String>,

    /// Show logs since a timestamp (2013-01-02T13:23:37Z) or for a relative
    /// duration (42m).
    #[arg(long)]
    since: Option<String>,

    /// Show logs before a timestamp or relative duration.
    #[arg(long)]
    until: Option<String>,

    /// Number of lines to show from the end of the logs.
    #[arg(short = 'n', long, default_value = "all")]
    tail: String,

    /// Follow log output.
    #[arg(short, long)]
    follow: bool,

    /// Show timestamps.
    #[arg(short, long)]
    timestamps: bool,
}

impl ToolsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            ToolsSubcommand::ContainerClone(args) => clone(ctx, args).await,
            ToolsSubcommand::ContainerRemove(args) => remove(ctx, args).await,
            ToolsSubcommand::ContainerRestart(args) => {
                let engine = ctx.engine()?;
                let targets = targets(engine.as_ref(), args.containers, &local_hostname().unwrap_or_default()).await?;
                restart(engine.as_ref(), &targets).await
            }
            ToolsSubcommand::ContainerLogs(args) => {
                let options = args.options(chrono::Utc::now().timestamp())?;
                let engine = ctx.engine()?;
                let targets = targets(engine.as_ref(), args.containers, &local_hostname().unwrap_or_default()).await?;
                write_logs(engine.as_ref(), &targets, &options, &mut tokio::io::stdout()).await
            }
        }
    }
}

impl ContainerLogsArgs {
    fn options(&self, now: i64) -> Result<LogOptions, AgentError> {
        let tail = match self.tail.as_str() {
            "all" | "" => None,
            n => Some(
                n.parse()
                    .map_err(|_| AgentError::Config(format!("invalid --tail value: {}", n)))?,
            ),
        };
        Ok(LogOptions {
            tail,
            since: log_time(self.since.as_deref(), now)?,
            until: log_time(self.until.as_deref(), now)?,
            timestamps: self.timestamps,
            follow: self.follow,
        })
    }
}

/// Unix timestamp from an RFC 3339 time, a duration before `now` or a raw
/// timestamp. Missing means unbounded (0).
fn log_time(value: Option<&str>, now: i64) -> Result<i64, AgentError> {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return Ok(0);
    };
    if let Ok(ago) = humantime::parse_duration(value) {
        return Ok(now - ago.as_secs() as i64);
    }
    if let Ok(time) = chrono::DateTime::parse_from_rfc3339(value) {
        return Ok(time.timestamp());
    }
    value
        .parse()
        .map_err(|_| AgentError::Config(format!("invalid timestamp: {}", value)))
}

/// The named containers, or the one this process runs in.
async fn targets(engine: &dyn ContainerEngine, names: Vec<String>, hostname: &str) -> Result<Vec<String>> {
    if !names.is_empty() {
        return Ok(names.iter().map(|n| n.trim_start_matches('/').to_string()).collect());
    }
    info!("Using current container (if running inside a container)");
    let current = resolve_self(engine, hostname).await?;
    Ok(vec![current.id.unwrap_or_default()])
}

/// Restart every container; a failure does not stop the others.
async fn restart(engine: &dyn ContainerEngine, containers: &[String]) -> Result<()> {
    let mut failed = Vec::new();
    for name in containers {
        info!(container = %name, "Restarting container");
        if let Err(e) = engine.restart(name).await {
            error!(container = %name, error = %e, "Failed to restart container");
            failed.push(name.clone());
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("failed to restart container(s): {}", failed.join(", "));
    }
    Ok(())
}

/// Copy the logs of every container to `out`.
async fn write_logs<W>(
    engine: &dyn ContainerEngine,
    containers: &[String],
    options: &LogOptions,
    out: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut failed = Vec::new();
    for name in containers {
        info!(container = %name, "Fetching logs");
        let result = async {
            let mut stream = engine.log_stream(name, options).await?;
            while let Some(chunk) = stream.next().await {
                out.write_all(chunk?.as_bytes()).await?;
            }
            out.flush().await?;
            Ok::<_, AgentError>(())
        }
        .await;
        if let Err(e) = result {
            error!(container = %name, error = %e, "Failed to fetch logs");
            failed.push(name.clone());
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("failed to fetch logs of container(s): {}", failed.join(", "));
    }
    Ok(())
}

impl CloneArgs {
    fn request(self) -> UpdateRequest {
        UpdateRequest {
            container: self.container.filter(|c| !c.is_empty()),
            spec: CloneSpec {
                image: self.image.filter(|i| !i.is_empty()),
                env: self.env,
                extra_hosts: self.add_host,
                auto_remove: self.auto_remove,
                healthy_after: self.duration,
                stop_timeout: self.stop_timeout,
                stop_after: self.stop_after,
                ignore_port_conflicts: self.ignore_ports,
                wait_for_exit: self.wait_for_exit,
                ..CloneSpec::default()
            },
            force: self.force,
            fork: self.fork,
            check_only: self.check,
        }
    }
}

async fn clone(ctx: CommandContext, args: CloneArgs) -> Result<()> {
    let mut orchestrator = Orchestrator::new(ctx.engine()?)
        .with_credentials(ctx.credentials())
        .with_pull_policy(ctx.pull_policy());

    match orchestrator.update(&args.request()).await? {
        UpdateOutcome::Updated { container_id } => {
            info!(container_id = %container_id, "Container updated");
            Ok(())
        }
        UpdateOutcome::Forked { helper_id } => {
            info!(helper_id = %helper_id, "Update handed over to helper container");
            Ok(())
        }
        UpdateOutcome::UpdateNeeded => Ok(()),
        UpdateOutcome::NotNeeded => {
            Err(AgentError::NotApplicable("image does not need updating".to_string()).into())
        }
    }
}

/// Remove every container; a failure does not stop the others.
async fn remove(ctx: CommandContext, args: ContainerRemoveArgs) -> Result<()> {
    let engine = ctx.engine()?;
    let mut failed = Vec::new();
    for name in &args.containers {
        if let Err(e) = engine::stop_remove(engine.as_ref(), name).await {
            error!(container = %name, error = %e, "Failed to remove container");
            failed.push(name.clone());
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("failed to remove container(s): {}", failed.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockContainer, MockEngine};
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(subcommand)]
        command: ToolsSubcommand,
    }

    fn parse(args: &[&str]) -> CloneArgs {
        let argv = std::iter::once("tools").chain(args.iter().copied());
        match Harness::parse_from(argv).command {
            ToolsSubcommand::ContainerClone(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    fn logs_args(args: &[&str]) -> ContainerLogsArgs {
        let argv = ["tools", "container-logs"].into_iter().chain(args.iter().copied());
        match Harness::parse_from(argv).command {
            ToolsSubcommand::ContainerLogs(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_logs_options() {
        let now = 1_700_000_000;
        let args = logs_args(&["app", "-n", "20", "--since", "42m", "--until", "2023-11-14T22:13:20Z", "-t"]);
        assert_eq!(args.containers, vec!["app"]);

        let options = args.options(now).unwrap();
        assert_eq!(options.tail, Some(20));
        assert_eq!(options.since, now - 42 * 60);
        assert_eq!(options.until, 1_700_000_000);
        assert!(options.timestamps);
        assert!(!options.follow);

        let options = logs_args(&[]).options(now).unwrap();
        assert_eq!(options, LogOptions::default());
    }

    #[test]
    fn test_logs_rejects_bad_values() {
        assert!(logs_args(&["--tail", "many"]).options(0).is_err());
        assert!(logs_args(&["--since", "yesterday"]).options(0).is_err());
        assert_eq!(log_time(Some("1699999999"), 0).unwrap(), 1_699_999_999);
    }

    #[tokio::test]
    async fn test_write_logs() {
        let engine = MockEngine::new();
        engine.add_container(MockContainer::new("a1", "app", "app:1").running());
        engine.set_logs("app", &["one", "two", "three"]);

        let mut out = Vec::new();
        let options = LogOptions {
            tail: Some(2),
            ..LogOptions::default()
        };
        write_logs(&engine, &["app".to_string()], &options, &mut out)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "two\nthree\n");

        let mut out = Vec::new();
        let err = write_logs(&engine, &["gone".to_string(), "app".to_string()], &options, &mut out)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gone"));
        assert_eq!(String::from_utf8(out).unwrap(), "two\nthree\n");
    }

    #[tokio::test]
    async fn test_restart_defaults_to_current_container() {
        let engine = MockEngine::new();
        engine.add_container(MockContainer::new("0123456789abcdef", "agent", "agent:1").running());
        engine.add_container(MockContainer::new("b2", "db", "postgres:16").running());

        let current = targets(&engine, Vec::new(), "0123456789ab").await.unwrap();
        assert_eq!(current, vec!["0123456789abcdef"]);
        restart(&engine, &current).await.unwrap();
        assert!(engine.calls().contains(&"restart:0123456789abcdef".to_string()));

        let named = targets(&engine, vec!["/db".to_string()], "").await.unwrap();
        assert_eq!(named, vec!["db"]);

        let err = restart(&engine, &["db".to_string(), "gone".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("gone"));
        assert!(engine.calls().contains(&"restart:db".to_string()));
    }

    #[test]
    fn test_clone_defaults() {
        let request = parse(&["container-clone"]).request();
        assert_eq!(request.container, None);
        assert_eq!(request.spec.image, None);
        assert_eq!(request.spec.healthy_after, Duration::from_secs(15));
        assert_eq!(request.spec.stop_timeout, Duration::from_secs(60));
        assert!(!request.check_only && !request.fork && !request.force);
    }

    #[test]
    fn test_clone_flags() {
        let request = parse(&[
            "container-clone",
            "--container",
            "app",
            "--image",
            "nginx:2",
            "--duration",
            "1m",
            "--stop-timeout",
            "90s",
            "--rm",
            "--add-host",
            "a:1.2.3.4",
            "--add-host",
            "b:5.6.7.8",
            "--env",
            "A=1,B=2",
            "--wait-for-exit",
            "--check",
            "--ignore-ports",
        ])
        .request();

        assert_eq!(request.container.as_deref(), Some("app"));
        assert_eq!(request.spec.image.as_deref(), Some("nginx:2"));
        assert_eq!(request.spec.healthy_after, Duration::from_secs(60));
        assert_eq!(request.spec.stop_timeout, Duration::from_secs(90));
        assert!(request.spec.auto_remove);
        assert_eq!(request.spec.extra_hosts, vec!["a:1.2.3.4", "b:5.6.7.8"]);
        assert_eq!(request.spec.env, vec!["A=1", "B=2"]);
        assert!(request.spec.wait_for_exit);
        assert!(request.spec.ignore_port_conflicts);
        assert!(request.check_only);
    }

    #[test]
    fn test_fork_entrypoint_round_trips_through_parser() {
        let spec = CloneSpec {
            image: Some("nginx:2".into()),
            env: vec!["A=1".into(), "B=2".into()],
            extra_hosts: vec!["db:10.0.0.1".into()],
            auto_remove: true,
            healthy_after: Duration::from_secs(45),
            stop_timeout: Duration::from_secs(90),
            stop_after: Duration::from_secs(5),
            ignore_port_conflicts: true,
            wait_for_exit: true,
            ..CloneSpec::default()
        };
        let entrypoint = crate::orchestrator::fork_entrypoint(false, "abc", "nginx:2", &spec);
        // drop the program name
        let args: Vec<&str> = entrypoint.iter().skip(2).map(String::as_str).collect();

        let request = parse(&args).request();
        assert_eq!(request.container.as_deref(), Some("abc"));
        assert_eq!(request.spec, spec);
        assert!(!request.fork && !request.check_only);

        let entrypoint = crate::orchestrator::fork_entrypoint(true, "abc", "nginx:2", &CloneSpec::default());
        let args: Vec<&str> = entrypoint.iter().skip(3).map(String::as_str).collect();
        let request = parse(&args).request();
        assert_eq!(
            request.spec,
            CloneSpec {
                image: Some("nginx:2".into()),
                ..CloneSpec::default()
            }
        );
    }
}

//! `run`: the container monitor and reconciliation service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::reconciler::{
    route_health_checks, run_metrics_timer, Monitor, Reconciler, ReconcilerHandle,
    ReconcilerSettings,
};
use crate::registry::{Registry, TedgeRegistry};

use super::CommandContext;

/// Delay between cloud identity lookups.
const IDENTITY_RETRY: Duration = Duration::from_secs(10);

/// How long background tasks get to stop after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Args)]
pub struct RunCommand {
    /// Run a single update and exit.
    #[arg(long)]
    once: bool,

    /// Only include containers whose name matches.
    #[arg(long = "name")]
    names: Vec<String>,

    /// Only include containers with this label.
    #[arg(long = "label")]
    labels: Vec<String>,

    /// Only include containers with this id.
    #[arg(long = "id")]
    ids: Vec<String>,

    /// Only include these service types (container, container-group).
    #[arg(long = "type", value_delimiter = ',')]
    types: Vec<String>,

    /// Name of the agent's own service.
    #[arg(long)]
    service_name: Option<String>,

    /// MQTT topic root.
    #[arg(long)]
    topic_root: Option<String>,

    /// Topic id of the device.
    #[arg(long)]
    topic_id: Option<String>,

    /// Cloud identity of the device. Looked up when not set.
    #[arg(long)]
    device_id: Option<String>,

    /// Metrics interval, e.g. `5m`.
    #[arg(long)]
    interval: Option<String>,
}

impl RunCommand {
    /// Flags override the configuration.
    fn apply(&self, config: &mut Config) {
        let include = &mut config.filter.include;
        for (flag, value) in [
            (&self.names, &mut include.names),
            (&self.labels, &mut include.labels),
            (&self.ids, &mut include.ids),
            (&self.types, &mut include.types),
        ] {
            if !flag.is_empty() {
                *value = flag.clone();
            }
        }
        if let Some(v) = &self.service_name {
            config.service_name = v.clone();
        }
        if let Some(v) = &self.topic_root {
            config.topic_root = v.clone();
        }
        if let Some(v) = &self.topic_id {
            config.topic_id = v.clone();
        }
        if let Some(v) = &self.device_id {
            config.device_id = v.clone();
        }
        if let Some(v) = &self.interval {
            config.metrics.interval = v.clone();
        }
    }

    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let mut config = ctx.config.clone();
        self.apply(&mut config);
        let ctx = CommandContext { config };
        let config = &ctx.config;

        let metrics_interval = config.metrics_interval()?;
        let filter = config.filter_spec();
        let mut device = config.device_target();
        let service = device.service(&config.service_name);
        info!(
            device = %device.topic_id,
            service = %service.topic_id,
            once = self.once,
            "Starting container service"
        );

        // `stop` follows the signals; `shutdown` stops the workers once the
        // MQTT session has been closed
        let (stop_tx, stop_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (health_tx, health_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            wait_for_signal().await;
            let _ = stop_tx.send(true);
        });

        let (registry, session) = TedgeRegistry::new(&config.client, service.clone(), health_tx)
            .context("failed to create thin-edge.io clients")?;
        let registry = Arc::new(registry);
        let session_task = tokio::spawn(session.run(shutdown_rx.clone()));

        if let Err(e) = registry.register_self(&device).await {
            warn!(error = %e, "Could not register the agent service");
        }

        if device.cloud_identity.is_empty() {
            match lookup_cloud_identity(&registry, stop_rx.clone()).await {
                Some(identity) => {
                    info!(cloud_identity = %identity, "Found cloud identity");
                    device = device.with_cloud_identity(&identity);
                }
                None => {
                    close_session(&registry, session_task).await;
                    let _ = shutdown_tx.send(true);
                    return Ok(());
                }
            }
        }

        let engine = ctx.engine()?;
        let settings = ReconcilerSettings {
            events_enabled: config.events.enabled,
            delete_from_cloud: config.delete_from_cloud.enabled,
            delete_orphans: config.delete_from_cloud.orphans,
            ..ReconcilerSettings::new(device.clone(), service.with_cloud_identity(&device.cloud_identity))
        };
        let registry_dyn: Arc<dyn Registry> = registry.clone();
        let reconciler = Reconciler::new(engine, registry_dyn, settings);
        let (handle, actor_task) = ReconcilerHandle::spawn(reconciler.clone(), shutdown_rx.clone());

        if self.once {
            let result = handle.update(filter).await;
            close_session(&registry, session_task).await;
            let _ = shutdown_tx.send(true);
            let _ = actor_task.await;
            return result.context("update failed");
        }

        let mut tasks = Vec::new();

        let monitor = Monitor::new(&reconciler, handle.clone());
        tasks.push(tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            let filter = filter.clone();
            async move { monitor.run(shutdown_rx, &filter).await }
        }));

        if config.metrics.enabled {
            info!(interval = ?metrics_interval, "Publishing container metrics");
            tasks.push(tokio::spawn(run_metrics_timer(
                handle.clone(),
                filter.clone(),
                metrics_interval,
                shutdown_rx.clone(),
            )));
        } else {
            info!("Metrics collection is disabled");
        }

        tasks.push(tokio::spawn(route_health_checks(
            handle.clone(),
            health_rx,
            config.service_name.clone(),
            shutdown_rx.clone(),
        )));

        let mut stop = stop_rx;
        let _ = stop.wait_for(|stopped| *stopped).await;

        close_session(&registry, session_task).await;
        let _ = shutdown_tx.send(true);

        info!("Waiting for workers to shut down...");
        let all = async {
            for task in tasks {
                let _ = task.await;
            }
            let _ = actor_task.await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, all).await.is_err() {
            warn!("Workers did not stop in time");
        }

        info!("Container service shutdown complete");
        Ok(())
    }
}

/// Disconnect from the broker (no last will) and let the session drain.
async fn close_session(registry: &TedgeRegistry, session: JoinHandle<()>) {
    if let Err(e) = registry.disconnect().await {
        warn!(error = %e, "Failed to disconnect from MQTT broker");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, session).await.is_err() {
        warn!("MQTT session did not close in time");
    }
}

/// Look up the cloud identity until it succeeds. `None` on shutdown.
async fn lookup_cloud_identity(
    registry: &TedgeRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> Option<String> {
    loop {
        match registry.lookup_cloud_identity().await {
            Ok(identity) if !identity.is_empty() => return Some(identity),
            Ok(_) => warn!("Cloud identity is empty"),
            Err(e) => warn!(error = %e, "Could not get cloud identity. Retrying later"),
        }

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }

            _ = tokio::time::sleep(IDENTITY_RETRY) => {}
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Received shutdown signal");
}

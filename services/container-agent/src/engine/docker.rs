//! Docker-compatible engine over the bollard API client.
//!
//! Works against Docker and Podman sockets. The socket is discovered from
//! `DOCKER_HOST`/`CONTAINER_HOST` or the well-known socket paths.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, RenameContainerOptions, RestartContainerOptions, StartContainerOptions,
    Stats, StatsOptions,
    StopContainerOptions, UpdateContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, ImportImageOptions, PruneImagesOptions};
use bollard::models::{ContainerSummary, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{TimeZone, Utc};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use super::{
    human_size, ContainerEngine, ContainerInspectResponse, ContainerRecord, ContainerStats,
    CreateConfig, EngineEvent, EventStream, FilterSpec, LogOptions, LogStream, PortMapping, RegistryAuth,
};
use crate::error::AgentError;

/// Socket candidates after the environment variables.
const SOCKET_CANDIDATES: &[&str] = &[
    "unix:///var/run/docker.sock",
    "unix:///run/podman/podman.sock",
    "unix:///run/user/0/podman/podman.sock",
];

/// Engine backed by a Docker-compatible API.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the first available engine socket.
    pub fn connect() -> Result<Self, AgentError> {
        let env_candidates = ["DOCKER_HOST", "CONTAINER_HOST"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty());
        let candidates: Vec<String> = env_candidates
            .chain(SOCKET_CANDIDATES.iter().map(|s| s.to_string()))
            .collect();

        if let Some(addr) = find_engine_socket(&candidates) {
            info!(value = %addr, "Using container engine socket");
            // bollard and podman-remote both read these
            std::env::set_var("DOCKER_HOST", &addr);
            std::env::set_var("CONTAINER_HOST", &addr);
        }

        let docker = Docker::connect_with_defaults()?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// First unix socket that exists, or the first non-socket address.
fn find_engine_socket(candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .find(|addr| match addr.strip_prefix("unix://") {
            Some(path) => Path::new(path).exists(),
            None => true,
        })
        .cloned()
}

/// Map 404 responses to `NotFound`.
fn map_err(err: BollardError, what: &str) -> AgentError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => AgentError::NotFound(what.to_string()),
        other => AgentError::Engine(other),
    }
}

fn record_from_summary(item: ContainerSummary) -> ContainerRecord {
    let name = item
        .names
        .as_ref()
        .and_then(|names| names.first())
        .cloned()
        .unwrap_or_default();

    let mut record = ContainerRecord::new(
        item.id.as_deref().unwrap_or_default(),
        &name,
        item.image.as_deref().unwrap_or_default(),
        item.state.as_deref().unwrap_or_default(),
        item.labels.clone().unwrap_or_default(),
    );

    record.container_status = item.status.clone().unwrap_or_default();
    record.command = item.command.clone().unwrap_or_default();
    record.created_at = item
        .created
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
    record.network_mode = item
        .host_config
        .as_ref()
        .and_then(|h| h.network_mode.clone())
        .unwrap_or_default();

    record.ports = item
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|port| PortMapping {
            ip: port.ip,
            public: port.public_port,
            private: port.private_port,
            protocol: port
                .typ
                .and_then(|t| serde_json::to_value(t).ok())
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "tcp".to_string()),
        })
        .collect();

    if let Some(networks) = item.network_settings.and_then(|n| n.networks) {
        let mut names: Vec<String> = networks.keys().cloned().collect();
        names.sort();
        record.networks = names;
        record.network_ids = networks.into_values().filter_map(|n| n.network_id).collect();
    }

    let size_rw = item.size_rw.unwrap_or_default();
    let size_root = item.size_root_fs.unwrap_or_default();
    record.filesystem = if size_root > 0 {
        format!("{} (virtual {})", human_size(size_rw), human_size(size_root))
    } else {
        human_size(size_rw)
    };

    record
}

fn stats_from_engine(stats: &Stats) -> ContainerStats {
    let cpu = &stats.cpu_stats;
    let precpu = &stats.precpu_stats;

    let cpu_delta = cpu.cpu_usage.total_usage as f64 - precpu.cpu_usage.total_usage as f64;
    let system_delta = cpu.system_cpu_usage.unwrap_or_default() as f64
        - precpu.system_cpu_usage.unwrap_or_default() as f64;
    let online_cpus = cpu.online_cpus.unwrap_or_else(|| {
        cpu.cpu_usage
            .percpu_usage
            .as_ref()
            .map(|v| v.len() as u64)
            .unwrap_or(1)
    }) as f64;

    let cpu_percent = if cpu_delta > 0.0 && system_delta > 0.0 {
        cpu_delta / system_delta * online_cpus * 100.0
    } else {
        0.0
    };

    let usage = stats.memory_stats.usage.unwrap_or_default() as f64;
    let limit = stats.memory_stats.limit.unwrap_or_default() as f64;
    let memory_percent = if limit > 0.0 { usage / limit * 100.0 } else { 0.0 };

    let net_tx = stats
        .networks
        .as_ref()
        .map(|n| n.values().map(|s| s.tx_bytes as f64).sum())
        .unwrap_or_default();

    ContainerStats {
        cpu_percent,
        memory_percent,
        net_tx,
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(&self, filter: &FilterSpec) -> Result<Vec<ContainerRecord>, AgentError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if !filter.names.is_empty() {
            filters.insert("name".into(), filter.names.clone());
        }
        if !filter.ids.is_empty() {
            filters.insert("id".into(), filter.ids.clone());
        }
        if !filter.labels.is_empty() {
            filters.insert("label".into(), filter.labels.clone());
        }

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                size: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers.into_iter().map(record_from_summary).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse, AgentError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err(e, id))
    }

    async fn image_id(&self, reference: &str) -> Result<Option<String>, AgentError> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(image.id),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<(), AgentError> {
        let credentials = auth.filter(|a| a.is_set()).map(|a| DockerCredentials {
            username: Some(a.username.clone()),
            password: Some(a.password.clone()),
            serveraddress: (!a.server.is_empty()).then(|| a.server.clone()),
            ..Default::default()
        });

        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: reference,
                    ..Default::default()
                }),
                None,
                credentials,
            )
            .try_for_each(|progress| async move {
                if let Some(status) = progress.status {
                    debug!(status = %status, "Pull progress");
                }
                Ok(())
            })
            .await
            .map_err(|e| map_err(e, reference))
    }

    async fn load_image(&self, path: &Path) -> Result<Vec<String>, AgentError> {
        let archive = tokio::fs::read(path).await?;
        let output: Vec<_> = self
            .docker
            .import_image(ImportImageOptions { quiet: false }, archive.into(), None)
            .try_collect()
            .await?;

        Ok(output
            .into_iter()
            .filter_map(|info| info.stream)
            .flat_map(|s| s.lines().map(str::to_string).collect::<Vec<_>>())
            .filter_map(|line| {
                line.strip_prefix("Loaded image: ")
                    .or_else(|| line.strip_prefix("Loaded image ID: "))
                    .map(|s| s.trim().to_string())
            })
            .collect())
    }

    async fn create(&self, name: &str, config: CreateConfig<String>) -> Result<String, AgentError> {
        // an empty name lets the engine pick one
        let options = (!name.is_empty()).then(|| CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        });
        let response = self.docker.create_container(options, config).await?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), AgentError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(e, id))
    }

    async fn restart(&self, id: &str) -> Result<(), AgentError> {
        self.docker
            .restart_container(id, None::<RestartContainerOptions>)
            .await
            .map_err(|e| map_err(e, id))
    }

    async fn stop(&self, id: &str, timeout: Option<Duration>) -> Result<(), AgentError> {
        let options = timeout.map(|t| StopContainerOptions {
            t: t.as_secs() as i64,
        });
        match self.docker.stop_container(id, options).await {
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            other => other.map_err(|e| map_err(e, id)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), AgentError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_err(e, id))
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<(), AgentError> {
        self.docker
            .rename_container(id, RenameContainerOptions { name: new_name })
            .await
            .map_err(|e| map_err(e, id))
    }

    async fn disable_restart(&self, id: &str) -> Result<(), AgentError> {
        self.docker
            .update_container(
                id,
                UpdateContainerOptions::<String> {
                    restart_policy: Some(RestartPolicy {
                        name: Some(RestartPolicyNameEnum::NO),
                        maximum_retry_count: None,
                    }),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_err(e, id))
    }

    async fn ensure_network(&self, name: &str) -> Result<(), AgentError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => {
                info!(name = %name, id = ?network.id, "Network already exists");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                let created = self
                    .docker
                    .create_network(CreateNetworkOptions {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .await?;
                info!(name = %name, id = ?created.id, "Created network");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn events(&self) -> Result<EventStream, AgentError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);

        let stream = self
            .docker
            .events(Some(EventsOptions::<String> {
                since: None,
                until: None,
                filters,
            }))
            .map(|item| {
                let message = item?;
                let actor = message.actor.unwrap_or_default();
                Ok(EngineEvent {
                    action: message.action.unwrap_or_default(),
                    id: actor.id.unwrap_or_default(),
                    attributes: actor.attributes.unwrap_or_default(),
                })
            });

        Ok(stream.boxed())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, AgentError> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        match stream.next().await {
            Some(Ok(stats)) => Ok(stats_from_engine(&stats)),
            Some(Err(e)) => Err(map_err(e, id)),
            None => Err(AgentError::NotFound(format!("stats for {}", id))),
        }
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, AgentError> {
        let lines: Vec<_> = self
            .docker
            .logs(
                id,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    tail: tail.to_string(),
                    ..Default::default()
                }),
            )
            .try_collect()
            .await
            .map_err(|e| map_err(e, id))?;
        Ok(lines.iter().map(ToString::to_string).collect())
    }

    async fn log_stream(&self, id: &str, options: &LogOptions) -> Result<LogStream, AgentError> {
        let owned = id.to_string();
        let stream = self
            .docker
            .logs(
                id,
                Some(LogsOptions::<String> {
                    follow: options.follow,
                    stdout: true,
                    stderr: true,
                    since: options.since,
                    until: options.until,
                    timestamps: options.timestamps,
                    tail: options
                        .tail
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "all".to_string()),
                })
            )
            .map(move |chunk| chunk.map(|c| c.to_string()).map_err(|e| map_err(e, &owned)));
        Ok(stream.boxed())
    }

    async fn prune_unused_images(&self) -> Result<usize, AgentError> {
        let mut filters = HashMap::new();
        filters.insert("dangling", vec!["false"]);

        let response = self
            .docker
            .prune_images(Some(PruneImagesOptions { filters }))
            .await?;

        let deleted = response.images_deleted.unwrap_or_default().len();
        info!(
            deleted,
            space_reclaimed = response.space_reclaimed.unwrap_or_default(),
            "Pruned unused images"
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::Port;

    #[test]
    fn test_find_engine_socket_prefers_existing() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        std::fs::write(&socket, b"").unwrap();

        let candidates = vec![
            "unix:///nonexistent/docker.sock".to_string(),
            format!("unix://{}", socket.display()),
        ];
        assert_eq!(find_engine_socket(&candidates), Some(candidates[1].clone()));
    }

    #[test]
    fn test_find_engine_socket_accepts_tcp() {
        let candidates = vec!["tcp://10.0.0.1:2375".to_string()];
        assert_eq!(find_engine_socket(&candidates).as_deref(), Some("tcp://10.0.0.1:2375"));
        assert_eq!(find_engine_socket(&[]), None);
    }

    #[test]
    fn test_record_from_summary() {
        let mut labels = HashMap::new();
        labels.insert("com.docker.compose.project".to_string(), "proj".to_string());
        labels.insert("com.docker.compose.service".to_string(), "web".to_string());

        let summary = ContainerSummary {
            id: Some("abc123".into()),
            names: Some(vec!["/proj-web-1".into()]),
            image: Some("nginx:latest".into()),
            state: Some("running".into()),
            status: Some("Up 2 minutes".into()),
            created: Some(1_700_000_000),
            labels: Some(labels),
            size_rw: Some(1500),
            ports: Some(vec![Port {
                ip: Some("0.0.0.0".into()),
                private_port: 80,
                public_port: Some(8080),
                typ: None,
            }]),
            ..Default::default()
        };

        let record = record_from_summary(summary);
        assert_eq!(record.name, "proj@web");
        assert_eq!(record.container_name, "proj-web-1");
        assert_eq!(record.container_status, "Up 2 minutes");
        assert_eq!(record.ports_text(), "0.0.0.0:8080:80/tcp");
        assert_eq!(record.filesystem, "1.5kB");
        assert_eq!(
            record.twin_fragment()["createdAt"],
            "2023-11-14T22:13:20Z"
        );
    }

    #[test]
    fn test_stats_without_previous_sample() {
        let stats: Stats = serde_json::from_value(serde_json::json!({
            "read": "", "preread": "", "num_procs": 0,
            "pids_stats": {}, "networks": {"eth0": {
                "rx_dropped": 0, "rx_bytes": 10, "rx_errors": 0, "tx_packets": 1,
                "tx_dropped": 0, "rx_packets": 1, "tx_errors": 0, "tx_bytes": 2048
            }},
            "memory_stats": {"usage": 50, "limit": 200},
            "blkio_stats": {},
            "cpu_stats": {"cpu_usage": {"total_usage": 100, "usage_in_usermode": 0, "usage_in_kernelmode": 0}, "throttling_data": {"periods": 0, "throttled_periods": 0, "throttled_time": 0}},
            "precpu_stats": {"cpu_usage": {"total_usage": 0, "usage_in_usermode": 0, "usage_in_kernelmode": 0}, "throttling_data": {"periods": 0, "throttled_periods": 0, "throttled_time": 0}},
            "storage_stats": {},
            "name": "/app", "id": "abc"
        }))
        .unwrap();

        let result = stats_from_engine(&stats);
        assert_eq!(result.cpu_percent, 0.0);
        assert_eq!(result.memory_percent, 25.0);
        assert_eq!(result.net_tx, 2048.0);
    }
}

//! In-memory container engine for tests and development.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{
    ContainerConfig, ContainerState, ContainerStateStatusEnum, EndpointSettings, Health,
    HealthConfig, HealthStatusEnum, HostConfig, NetworkSettings, RestartPolicy,
    RestartPolicyNameEnum,
};
use futures::StreamExt;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    ContainerEngine, ContainerInspectResponse, ContainerRecord, ContainerStats, CreateConfig,
    EngineEvent, EventStream, FilterSpec, LogOptions, LogStream, RegistryAuth,
};
use crate::error::AgentError;

/// A container held by [`MockEngine`].
#[derive(Debug, Clone, Default)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    /// Image reference from the container config.
    pub image: String,
    /// Id of the image the container runs.
    pub image_id: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub hostname: String,
    pub health: Option<HealthStatusEnum>,
    pub host_config: HostConfig,
    /// Network name to network id.
    pub networks: HashMap<String, String>,
    /// Create request this container came from, if any.
    pub created_from: Option<CreateConfig<String>>,
}

impl MockContainer {
    pub fn new(id: &str, name: &str, image: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.trim_start_matches('/').to_string(),
            image: image.to_string(),
            image_id: format!("sha256:{}", id),
            hostname: id.chars().take(12).collect(),
            host_config: HostConfig {
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ALWAYS),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn running(mut self) -> Self {
        self.running = true;
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn image_id(mut self, image_id: &str) -> Self {
        self.image_id = image_id.to_string();
        self
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    pub fn env(mut self, entry: &str) -> Self {
        self.env.push(entry.to_string());
        self
    }

    pub fn health(mut self, status: HealthStatusEnum) -> Self {
        self.health = Some(status);
        self
    }

    pub fn network(mut self, name: &str, id: &str) -> Self {
        self.networks.insert(name.to_string(), id.to_string());
        self
    }

    fn state(&self) -> &'static str {
        if self.running {
            "running"
        } else {
            "exited"
        }
    }

    fn record(&self) -> ContainerRecord {
        let mut record =
            ContainerRecord::new(&self.id, &self.name, &self.image, self.state(), self.labels.clone());
        let mut networks: Vec<String> = self.networks.keys().cloned().collect();
        networks.sort();
        record.networks = networks;
        record.network_ids = self.networks.values().cloned().collect();
        record
    }

    fn inspect(&self) -> ContainerInspectResponse {
        let healthcheck = self.health.as_ref().map(|_| HealthConfig {
            test: Some(vec!["CMD".into(), "true".into()]),
            ..Default::default()
        });
        let networks = self
            .networks
            .iter()
            .map(|(name, id)| {
                (
                    name.clone(),
                    EndpointSettings {
                        network_id: Some(id.clone()),
                        ..Default::default()
                    },
                )
            })
            .collect();

        ContainerInspectResponse {
            id: Some(self.id.clone()),
            name: Some(format!("/{}", self.name)),
            image: Some(self.image_id.clone()),
            config: Some(ContainerConfig {
                hostname: Some(self.hostname.clone()),
                image: Some(self.image.clone()),
                labels: Some(self.labels.clone()),
                env: Some(self.env.clone()),
                healthcheck,
                ..Default::default()
            }),
            state: Some(ContainerState {
                running: Some(self.running),
                status: Some(if self.running {
                    ContainerStateStatusEnum::RUNNING
                } else {
                    ContainerStateStatusEnum::EXITED
                }),
                health: self.health.clone().map(|status| Health {
                    status: Some(status),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            host_config: Some(self.host_config.clone()),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn matches(&self, filter: &FilterSpec) -> bool {
        let names_ok = filter.names.is_empty()
            || filter.names.iter().any(|pattern| {
                Regex::new(pattern)
                    .map(|re| re.is_match(&self.name))
                    .unwrap_or(false)
            });
        let ids_ok =
            filter.ids.is_empty() || filter.ids.iter().any(|id| self.id.starts_with(id.as_str()));
        let labels_ok = filter.labels.iter().all(|l| match l.split_once('=') {
            Some((k, v)) => self.labels.get(k).map(String::as_str) == Some(v),
            None => self.labels.contains_key(l),
        });
        names_ok && ids_ok && labels_ok
    }
}

#[derive(Default)]
struct MockState {
    containers: Vec<MockContainer>,
    /// Image reference to image id.
    images: HashMap<String, String>,
    calls: Vec<String>,
    pull_failures: u32,
    pull_auths: Vec<Option<RegistryAuth>>,
    loadable: Vec<String>,
    fail_starts: bool,
    stats: HashMap<String, ContainerStats>,
    failing_stats: HashSet<String>,
    subscribers: Vec<mpsc::UnboundedSender<Result<EngineEvent, AgentError>>>,
    networks: HashSet<String>,
    inspect_failures: HashMap<String, u32>,
    log_lines: HashMap<String, Vec<String>>,
    created_health: Option<HealthStatusEnum>,
    next_id: u64,
}

impl MockState {
    fn find(&self, key: &str) -> Option<usize> {
        let key = key.trim_start_matches('/');
        self.containers
            .iter()
            .position(|c| c.id == key || c.name == key)
    }

    fn find_or_err(&self, key: &str) -> Result<usize, AgentError> {
        self.find(key)
            .ok_or_else(|| AgentError::NotFound(format!("container {}", key)))
    }
}

/// In-memory engine. Every mutating call is recorded in [`MockEngine::calls`].
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // a poisoned lock only happens after a test already panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_container(&self, container: MockContainer) {
        self.lock().containers.push(container);
    }

    pub fn add_image(&self, reference: &str, id: &str) {
        self.lock().images.insert(reference.to_string(), id.to_string());
    }

    /// Make the next `count` pulls fail.
    pub fn fail_pulls(&self, count: u32) {
        self.lock().pull_failures = count;
    }

    /// Containers are left stopped by `start`.
    pub fn fail_starts(&self) {
        self.lock().fail_starts = true;
    }

    /// The next `count` inspects of `id` fail with an engine error.
    pub fn fail_inspects(&self, id: &str, count: u32) {
        self.lock().inspect_failures.insert(id.to_string(), count);
    }

    /// Containers created from now on report `status` from their healthcheck.
    pub fn set_created_health(&self, status: HealthStatusEnum) {
        self.lock().created_health = Some(status);
    }

    /// Output returned by `log_stream` for the container `key`.
    pub fn set_logs(&self, key: &str, lines: &[&str]) {
        self.lock()
            .log_lines
            .insert(key.to_string(), lines.iter().map(|l| format!("{}\n", l)).collect());
    }

    /// References reported by the next image load.
    pub fn set_loadable(&self, references: &[&str]) {
        self.lock().loadable = references.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_stats(&self, id: &str, stats: ContainerStats) {
        self.lock().stats.insert(id.to_string(), stats);
    }

    pub fn fail_stats(&self, id: &str) {
        self.lock().failing_stats.insert(id.to_string());
    }

    /// Recorded calls, e.g. `stop:abc` or `rename:abc:app-bak-1`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Credentials passed to each pull attempt.
    pub fn pull_auths(&self) -> Vec<Option<RegistryAuth>> {
        self.lock().pull_auths.clone()
    }

    pub fn container(&self, key: &str) -> Option<MockContainer> {
        let state = self.lock();
        state.find(key).map(|i| state.containers[i].clone())
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        self.lock().containers.clone()
    }

    pub fn set_running(&self, key: &str, running: bool) {
        let mut state = self.lock();
        if let Some(i) = state.find(key) {
            state.containers[i].running = running;
        }
    }

    /// Send an event to every open event stream.
    pub fn emit(&self, event: EngineEvent) {
        let mut state = self.lock();
        state
            .subscribers
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    /// Fail every open event stream.
    pub fn emit_error(&self, message: &str) {
        let mut state = self.lock();
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(Err(AgentError::Io(std::io::Error::other(message.to_string()))));
        }
    }

    /// End every open event stream.
    pub fn close_events(&self) {
        self.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn record_call(&self, call: String) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn list_containers(&self, filter: &FilterSpec) -> Result<Vec<ContainerRecord>, AgentError> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|c| c.matches(filter))
            .map(MockContainer::record)
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse, AgentError> {
        let mut state = self.lock();
        if let Some(left) = state.inspect_failures.get_mut(id).filter(|n| **n > 0) {
            *left -= 1;
            return Err(AgentError::Engine(bollard::errors::Error::DockerResponseServerError {
                status_code: 500,
                message: format!("inspect {} failed", id),
            }));
        }
        let i = state.find_or_err(id)?;
        Ok(state.containers[i].inspect())
    }

    async fn image_id(&self, reference: &str) -> Result<Option<String>, AgentError> {
        Ok(self.lock().images.get(reference).cloned())
    }

    async fn pull(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<(), AgentError> {
        let mut state = self.lock();
        state.calls.push(format!("pull:{}", reference));
        state.pull_auths.push(auth.cloned());
        if state.pull_failures > 0 {
            state.pull_failures -= 1;
            return Err(AgentError::Registry(format!("pull access denied for {}", reference)));
        }
        state
            .images
            .entry(reference.to_string())
            .or_insert_with(|| format!("sha256:{}", reference));
        Ok(())
    }

    async fn load_image(&self, path: &Path) -> Result<Vec<String>, AgentError> {
        let mut state = self.lock();
        state.calls.push(format!("load:{}", path.display()));
        let loaded = std::mem::take(&mut state.loadable);
        for reference in &loaded {
            state
                .images
                .insert(reference.clone(), format!("sha256:{}", reference));
        }
        Ok(loaded)
    }

    async fn create(&self, name: &str, config: CreateConfig<String>) -> Result<String, AgentError> {
        let mut state = self.lock();
        if state.find(name).is_some() {
            return Err(AgentError::Registry(format!("container name {} is already in use", name)));
        }
        state.next_id += 1;
        let id = format!("created{:04}", state.next_id);
        state.calls.push(format!("create:{}", name));

        let image = config.image.clone().unwrap_or_default();
        let image_id = state
            .images
            .get(&image)
            .cloned()
            .unwrap_or_else(|| format!("sha256:{}", image));

        let mut container = MockContainer::new(&id, name, &image).image_id(&image_id);
        container.health = state.created_health.clone();
        container.labels = config.labels.clone().unwrap_or_default();
        container.env = config.env.clone().unwrap_or_default();
        container.host_config = config.host_config.clone().unwrap_or_default();
        if let Some(networking) = &config.networking_config {
            container.networks = networking
                .endpoints_config
                .iter()
                .map(|(name, ep)| (name.clone(), ep.network_id.clone().unwrap_or_default()))
                .collect();
        }
        container.created_from = Some(config);
        state.containers.push(container);
        Ok(id)
    }

    async fn restart(&self, id: &str) -> Result<(), AgentError> {
        let mut state = self.lock();
        state.calls.push(format!("restart:{}", id));
        let i = state.find_or_err(id)?;
        state.containers[i].running = true;
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<(), AgentError> {
        let mut state = self.lock();
        state.calls.push(format!("start:{}", id));
        let i = state.find_or_err(id)?;
        if !state.fail_starts {
            state.containers[i].running = true;
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Option<Duration>) -> Result<(), AgentError> {
        let mut state = self.lock();
        state.calls.push(format!("stop:{}", id));
        let i = state.find_or_err(id)?;
        state.containers[i].running = false;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), AgentError> {
        let mut state = self.lock();
        state.calls.push(format!("remove:{}", id));
        let i = state.find_or_err(id)?;
        state.containers.remove(i);
        Ok(())
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<(), AgentError> {
        let mut state = self.lock();
        state.calls.push(format!("rename:{}:{}", id, new_name));
        let i = state.find_or_err(id)?;
        state.containers[i].name = new_name.to_string();
        Ok(())
    }

    async fn disable_restart(&self, id: &str) -> Result<(), AgentError> {
        let mut state = self.lock();
        state.calls.push(format!("disable_restart:{}", id));
        let i = state.find_or_err(id)?;
        state.containers[i].host_config.restart_policy = Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        });
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), AgentError> {
        let mut state = self.lock();
        state.calls.push(format!("ensure_network:{}", name));
        state.networks.insert(name.to_string());
        Ok(())
    }

    async fn events(&self) -> Result<EventStream, AgentError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, AgentError> {
        let state = self.lock();
        if state.failing_stats.contains(id) {
            return Err(AgentError::NotFound(format!("stats for {}", id)));
        }
        Ok(state.stats.get(id).copied().unwrap_or_default())
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, AgentError> {
        self.record_call(format!("logs:{}:{}", id, tail));
        Ok(format!("{} started\n", id))
    }

    async fn log_stream(&self, id: &str, options: &LogOptions) -> Result<LogStream, AgentError> {
        let mut state = self.lock();
        state.calls.push(format!("log_stream:{}", id));
        let i = state.find_or_err(id)?;
        let container = &state.containers[i];
        let mut lines = state
            .log_lines
            .get(&container.id)
            .or_else(|| state.log_lines.get(&container.name))
            .cloned()
            .unwrap_or_default();
        if let Some(tail) = options.tail {
            lines.drain(..lines.len().saturating_sub(tail));
        }
        Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
    }

    async fn prune_unused_images(&self) -> Result<usize, AgentError> {
        let mut state = self.lock();
        state.calls.push("prune".to_string());
        let used: HashSet<String> = state.containers.iter().map(|c| c.image.clone()).collect();
        let before = state.images.len();
        state.images.retain(|reference, _| used.contains(reference));
        Ok(before - state.images.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{list, stop_remove};

    #[tokio::test]
    async fn test_list_applies_server_side_filters() {
        let engine = MockEngine::new();
        engine.add_container(MockContainer::new("aaa111", "app", "nginx").running());
        engine.add_container(MockContainer::new("bbb222", "db", "postgres").label("tier", "data"));

        let all = list(&engine, &FilterSpec::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let by_name = list(&engine, &FilterSpec::exact_name("app")).await.unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].id, "aaa111");

        let by_label = FilterSpec {
            labels: vec!["tier=data".into()],
            ..Default::default()
        };
        let by_label = list(&engine, &by_label).await.unwrap();
        assert_eq!(by_label[0].name, "db");

        let by_id = list(&engine, &FilterSpec::default().narrowed_to("bbb")).await.unwrap();
        assert_eq!(by_id.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_remove_missing_is_ok() {
        let engine = MockEngine::new();
        stop_remove(&engine, "missing").await.unwrap();
        assert_eq!(engine.calls(), vec!["stop:missing"]);
    }

    #[tokio::test]
    async fn test_pull_failures_are_consumed() {
        let engine = MockEngine::new();
        engine.fail_pulls(1);
        assert!(engine.pull("app:1", None).await.is_err());
        engine.pull("app:1", None).await.unwrap();
        assert_eq!(
            engine.image_id("app:1").await.unwrap().as_deref(),
            Some("sha256:app:1")
        );
    }

    #[tokio::test]
    async fn test_events_end_when_closed() {
        let engine = MockEngine::new();
        let mut stream = engine.events().await.unwrap();
        engine.emit(EngineEvent::new("start", "abc"));
        engine.close_events();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.action, "start");
        assert!(stream.next().await.is_none());
    }
}

//! Container engine interface.
//!
//! The engine abstracts everything the agent asks of the container runtime:
//! - Listing containers as [`ContainerRecord`]s
//! - Inspect/create/start/stop/remove/rename for the clone workflow
//! - Image pulls, loads and pruning
//! - Event and stats streams for the reconciler
//!
//! [`docker::DockerEngine`] talks to a Docker-compatible API socket;
//! [`MockEngine`] is an in-memory engine for tests and development.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::AgentError;

pub mod docker;
pub mod mock;

pub use bollard::container::Config as CreateConfig;
pub use bollard::models::ContainerInspectResponse;
pub use mock::{MockContainer, MockEngine};

pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";
pub const LABEL_COMPOSE_SERVICE: &str = "com.docker.compose.service";
pub const LABEL_COMPOSE_WORKING_DIR: &str = "com.docker.compose.project.working_dir";

/// Marks helper containers created by a self-update fork.
pub const LABEL_FORK: &str = "io.tedge.fork";
pub const LABEL_FORKED_NAME: &str = "io.tedge.forked.name";

// =============================================================================
// Records
// =============================================================================

/// How a container is exposed as a software package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    /// A standalone container.
    Container,
    /// A member of a compose project.
    ContainerGroup,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Container => "container",
            ServiceType::ContainerGroup => "container-group",
        }
    }

    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            "container" => Some(ServiceType::Container),
            "container-group" => Some(ServiceType::ContainerGroup),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health as reported to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
}

impl Status {
    /// `running` and `up` are up; every other engine state is down.
    pub fn from_state(state: &str) -> Self {
        match state {
            "running" | "up" => Status::Up,
            _ => Status::Down,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Down => "down",
        }
    }
}

/// A published or exposed port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub ip: Option<String>,
    pub public: Option<u16>,
    pub private: u16,
    pub protocol: String,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.ip, self.public) {
            (_, None) | (_, Some(0)) => write!(f, "{}/{}", self.private, self.protocol),
            (Some(ip), Some(public)) if !ip.is_empty() => {
                write!(f, "{}:{}:{}/{}", ip, public, self.private, self.protocol)
            }
            (_, Some(public)) => write!(f, "{}:{}/{}", public, self.private, self.protocol),
        }
    }
}

/// Snapshot of one container, produced fresh by every list.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecord {
    pub id: String,
    /// Engine container name without the leading `/`.
    pub container_name: String,
    /// `project@service` for group members, the container name otherwise.
    pub name: String,
    pub service_type: ServiceType,
    pub status: Status,
    /// Raw engine state, e.g. `running` or `exited`.
    pub state: String,
    /// Engine status text, e.g. `Up 2 hours`.
    pub container_status: String,
    pub image: String,
    pub created_at: Option<DateTime<Utc>>,
    pub ports: Vec<PortMapping>,
    pub network_ids: Vec<String>,
    pub networks: Vec<String>,
    pub filesystem: String,
    pub command: String,
    pub network_mode: String,
    pub project_name: Option<String>,
    pub service_name: Option<String>,
    pub labels: HashMap<String, String>,
    /// When this record was observed.
    pub time: DateTime<Utc>,
}

impl ContainerRecord {
    /// A record for `id`/`container_name`; group membership is derived from
    /// the compose labels.
    pub fn new(
        id: &str,
        container_name: &str,
        image: &str,
        state: &str,
        labels: HashMap<String, String>,
    ) -> Self {
        let container_name = container_name.trim_start_matches('/').to_string();
        let project_name = labels.get(LABEL_COMPOSE_PROJECT).cloned();
        let service_name = labels.get(LABEL_COMPOSE_SERVICE).cloned();

        let (name, service_type) = match (&project_name, &service_name) {
            (Some(project), Some(service)) => {
                (format!("{}@{}", project, service), ServiceType::ContainerGroup)
            }
            (Some(_), None) => (container_name.clone(), ServiceType::ContainerGroup),
            _ => (container_name.clone(), ServiceType::Container),
        };

        Self {
            id: id.to_string(),
            container_name,
            name,
            service_type,
            status: Status::from_state(state),
            state: state.to_string(),
            container_status: String::new(),
            image: image.to_string(),
            created_at: None,
            ports: Vec::new(),
            network_ids: Vec::new(),
            networks: Vec::new(),
            filesystem: String::new(),
            command: String::new(),
            network_mode: String::new(),
            project_name,
            service_name,
            labels,
            time: Utc::now(),
        }
    }

    /// Ports in `priv/proto`, `pub:priv/proto` or `ip:pub:priv/proto` form.
    pub fn ports_text(&self) -> String {
        self.ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The `container` digital twin fragment.
    pub fn twin_fragment(&self) -> serde_json::Value {
        let mut fragment = serde_json::Map::new();
        let mut put = |key: &str, value: &str| {
            if !value.is_empty() {
                fragment.insert(key.to_string(), json!(value));
            }
        };
        put("containerId", &self.id);
        put("state", &self.state);
        put("containerStatus", &self.container_status);
        put(
            "createdAt",
            &self
                .created_at
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                .unwrap_or_default(),
        );
        put("image", &self.image);
        put("ports", &self.ports_text());
        put("networks", &self.networks.join(","));
        put("runningFor", &self.running_for());
        put("filesystem", &self.filesystem);
        put("command", &self.command);
        put("networkMode", &self.network_mode);
        put("serviceName", self.service_name.as_deref().unwrap_or_default());
        put("projectName", self.project_name.as_deref().unwrap_or_default());
        serde_json::Value::Object(fragment)
    }

    /// Retained health payload.
    pub fn health_payload(&self) -> serde_json::Value {
        json!({
            "status": self.status.as_str(),
            "time": self.time.timestamp(),
        })
    }

    /// Human readable age, e.g. `3 hours`.
    pub fn running_for(&self) -> String {
        let Some(created) = self.created_at else {
            return String::new();
        };
        let age = (self.time - created).to_std().unwrap_or_default();
        // whole seconds read better than humantime's sub-second output
        humantime::format_duration(Duration::from_secs(age.as_secs())).to_string()
    }
}

/// Format a byte count with three significant digits, e.g. `1.23MB`.
pub fn human_size(bytes: i64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    let digits = if value >= 100.0 {
        0
    } else if value >= 10.0 {
        1
    } else {
        2
    };
    let formatted = format!("{:.*}", digits, value);
    let formatted = if formatted.contains('.') {
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        formatted
    };
    format!("{}{}", formatted, UNITS[unit])
}

// =============================================================================
// Filters
// =============================================================================

/// Which containers an operation covers.
///
/// `names`, `ids` and `labels` are evaluated by the engine. `types`,
/// `exclude_names` and `exclude_with_label` are applied afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    pub names: Vec<String>,
    pub labels: Vec<String>,
    pub ids: Vec<String>,
    pub types: Vec<String>,
    /// Regular expressions; invalid patterns are skipped with a warning.
    pub exclude_names: Vec<String>,
    pub exclude_with_label: Vec<String>,
}

impl FilterSpec {
    /// No server-side filter is set. Client-side filters are not considered.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.labels.is_empty() && self.ids.is_empty()
    }

    /// Same filter restricted to a single container id.
    pub fn narrowed_to(&self, id: &str) -> Self {
        Self {
            ids: vec![id.to_string()],
            ..self.clone()
        }
    }

    /// Filter matching exactly one name.
    pub fn exact_name(name: &str) -> Self {
        Self {
            names: vec![format!("^{}$", regex::escape(name))],
            ..Self::default()
        }
    }

    /// Drop records rejected by the client-side filters.
    pub fn apply_client_side(&self, records: Vec<ContainerRecord>) -> Vec<ContainerRecord> {
        let excludes: Vec<Regex> = self
            .exclude_names
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Invalid excludeNames regex pattern");
                    None
                }
            })
            .collect();

        records
            .into_iter()
            .filter(|r| self.types.is_empty() || self.types.iter().any(|t| t == r.service_type.as_str()))
            .filter(|r| {
                !excludes
                    .iter()
                    .any(|re| re.is_match(&r.container_name) || re.is_match(&r.name))
            })
            .filter(|r| !self.exclude_with_label.iter().any(|l| r.labels.contains_key(l)))
            .collect()
    }
}

// =============================================================================
// Events and stats
// =============================================================================

/// A container event from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    /// e.g. `start`, `die`, `health_status: healthy`.
    pub action: String,
    pub id: String,
    pub attributes: HashMap<String, String>,
}

impl EngineEvent {
    pub fn new(action: &str, id: &str) -> Self {
        Self {
            action: action.to_string(),
            id: id.to_string(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn attribute(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or_default()
    }
}

pub type EventStream = BoxStream<'static, Result<EngineEvent, AgentError>>;

/// Chunks of combined stdout/stderr output.
pub type LogStream = BoxStream<'static, Result<String, AgentError>>;

/// Which log output to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Lines from the end; `None` is everything.
    pub tail: Option<usize>,
    /// Unix timestamps, 0 for unbounded.
    pub since: i64,
    pub until: i64,
    pub timestamps: bool,
    /// Keep streaming new output.
    pub follow: bool,
}

/// One-shot resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Bytes transmitted.
    pub net_tx: f64,
}

impl ContainerStats {
    /// `resource_usage` measurement payload.
    pub fn telemetry(&self) -> serde_json::Value {
        json!({
            "container": {
                "cpu": round_to(self.cpu_percent, 2),
                "memory": round_to(self.memory_percent, 2),
                "netio": round_to(self.net_tx, 0),
            }
        })
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Credentials for a registry pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RegistryAuth {
    #[serde(default)]
    pub server: String,
    pub username: String,
    pub password: String,
}

impl RegistryAuth {
    pub fn is_set(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

// =============================================================================
// Engine trait
// =============================================================================

/// Container engine interface.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Containers in any state matching the server-side part of `filter`.
    async fn list_containers(&self, filter: &FilterSpec) -> Result<Vec<ContainerRecord>, AgentError>;

    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse, AgentError>;

    /// Local image id for a reference, `None` if the image is not present.
    async fn image_id(&self, reference: &str) -> Result<Option<String>, AgentError>;

    async fn pull(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<(), AgentError>;

    /// Load an image archive, returning the loaded references.
    async fn load_image(&self, path: &Path) -> Result<Vec<String>, AgentError>;

    /// Create a container, returning its id.
    async fn create(&self, name: &str, config: CreateConfig<String>) -> Result<String, AgentError>;

    async fn start(&self, id: &str) -> Result<(), AgentError>;

    async fn restart(&self, id: &str) -> Result<(), AgentError>;

    /// Stop; `timeout` of `None` uses the container's stop timeout.
    async fn stop(&self, id: &str, timeout: Option<Duration>) -> Result<(), AgentError>;

    /// Force remove including anonymous volumes.
    async fn remove(&self, id: &str) -> Result<(), AgentError>;

    async fn rename(&self, id: &str, new_name: &str) -> Result<(), AgentError>;

    /// Set the restart policy to `no`.
    async fn disable_restart(&self, id: &str) -> Result<(), AgentError>;

    /// Create the network if it does not exist.
    async fn ensure_network(&self, name: &str) -> Result<(), AgentError>;

    /// Container event stream. The stream ending means the engine closed it.
    async fn events(&self) -> Result<EventStream, AgentError>;

    async fn stats(&self, id: &str) -> Result<ContainerStats, AgentError>;

    /// Last `tail` lines of combined stdout/stderr.
    async fn logs(&self, id: &str, tail: usize) -> Result<String, AgentError>;

    async fn log_stream(&self, id: &str, options: &LogOptions) -> Result<LogStream, AgentError>;

    /// Remove images not used by any container, returning how many went.
    async fn prune_unused_images(&self) -> Result<usize, AgentError>;
}

/// List containers applying both server- and client-side filters.
pub async fn list(
    engine: &dyn ContainerEngine,
    filter: &FilterSpec,
) -> Result<Vec<ContainerRecord>, AgentError> {
    let records = engine.list_containers(filter).await?;
    Ok(filter.apply_client_side(records))
}

/// Stop and remove a container. A missing container is not an error.
pub async fn stop_remove(engine: &dyn ContainerEngine, id: &str) -> Result<(), AgentError> {
    info!(container = %id, "Stopping container");
    match engine.stop(id, None).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            info!(container = %id, "Container does not exist, so nothing to stop");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    info!(container = %id, "Removing container");
    match engine.remove(id).await {
        Err(e) if !e.is_not_found() => Err(e),
        _ => Ok(()),
    }
}

/// Expand short Docker Hub references, e.g. `nginx` to
/// `docker.io/library/nginx`.
pub fn normalize_image_ref(image: &str) -> String {
    let (first, rest) = match image.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (image, None),
    };
    let is_domain = rest.is_some() && (first.contains('.') || first.contains(':') || first == "localhost");

    match (is_domain, rest) {
        (true, Some(rest)) if first == "docker.io" && !rest.contains('/') => {
            format!("docker.io/library/{}", rest)
        }
        (true, _) => image.to_string(),
        (false, Some(_)) => format!("docker.io/{}", image),
        (false, None) => format!("docker.io/library/{}", image),
    }
}

/// Registry host of an image reference.
pub fn image_domain(image: &str) -> String {
    normalize_image_ref(image)
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn record(name: &str, labels: HashMap<String, String>) -> ContainerRecord {
        ContainerRecord::new("abc", name, "nginx", "running", labels)
    }

    #[test]
    fn test_group_member_name() {
        let r = record(
            "/proj-web-1",
            labels(&[(LABEL_COMPOSE_PROJECT, "proj"), (LABEL_COMPOSE_SERVICE, "web")]),
        );
        assert_eq!(r.name, "proj@web");
        assert_eq!(r.container_name, "proj-web-1");
        assert_eq!(r.service_type, ServiceType::ContainerGroup);
    }

    #[test]
    fn test_single_container_name() {
        let r = record("/nodered", HashMap::new());
        assert_eq!(r.name, "nodered");
        assert_eq!(r.service_type, ServiceType::Container);
        assert_eq!(r.status, Status::Up);
    }

    #[rstest]
    #[case("running", Status::Up)]
    #[case("up", Status::Up)]
    #[case("exited", Status::Down)]
    #[case("paused", Status::Down)]
    #[case("", Status::Down)]
    fn test_status_from_state(#[case] state: &str, #[case] expected: Status) {
        assert_eq!(Status::from_state(state), expected);
    }

    #[rstest]
    #[case(None, None, 80, "80/tcp")]
    #[case(None, Some(8080), 80, "8080:80/tcp")]
    #[case(Some("0.0.0.0"), Some(8080), 80, "0.0.0.0:8080:80/tcp")]
    #[case(Some(""), Some(8080), 80, "8080:80/tcp")]
    fn test_port_format(
        #[case] ip: Option<&str>,
        #[case] public: Option<u16>,
        #[case] private: u16,
        #[case] expected: &str,
    ) {
        let port = PortMapping {
            ip: ip.map(str::to_string),
            public,
            private,
            protocol: "tcp".into(),
        };
        assert_eq!(port.to_string(), expected);
    }

    #[test]
    fn test_twin_fragment_omits_empty_fields() {
        let mut r = record("/nodered", HashMap::new());
        r.ports = vec![
            PortMapping {
                ip: None,
                public: None,
                private: 1880,
                protocol: "tcp".into(),
            },
            PortMapping {
                ip: Some("0.0.0.0".into()),
                public: Some(1880),
                private: 1880,
                protocol: "tcp".into(),
            },
        ];
        let fragment = r.twin_fragment();
        assert_eq!(fragment["containerId"], "abc");
        assert_eq!(fragment["ports"], "1880/tcp, 0.0.0.0:1880:1880/tcp");
        assert!(fragment.get("projectName").is_none());
        assert!(fragment.get("createdAt").is_none());
    }

    #[test]
    fn test_filter_is_empty_ignores_client_side() {
        let filter = FilterSpec {
            types: vec!["container".into()],
            exclude_names: vec!["x".into()],
            exclude_with_label: vec!["tedge.ignore".into()],
            ..Default::default()
        };
        assert!(filter.is_empty());
        assert!(!filter.narrowed_to("abc").is_empty());
    }

    #[test]
    fn test_client_side_filters() {
        let records = vec![
            record("/app", HashMap::new()),
            record("/tmp-build", HashMap::new()),
            record("/ignored", labels(&[("tedge.ignore", "")])),
            record(
                "/proj-db-1",
                labels(&[(LABEL_COMPOSE_PROJECT, "proj"), (LABEL_COMPOSE_SERVICE, "db")]),
            ),
        ];
        let filter = FilterSpec {
            types: vec!["container".into()],
            exclude_names: vec!["^tmp-".into(), "([invalid".into()],
            exclude_with_label: vec!["tedge.ignore".into()],
            ..Default::default()
        };

        let kept: Vec<String> = filter
            .apply_client_side(records)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(kept, vec!["app"]);
    }

    #[test]
    fn test_exclude_matches_display_name() {
        let records = vec![record(
            "/proj-db-1",
            labels(&[(LABEL_COMPOSE_PROJECT, "proj"), (LABEL_COMPOSE_SERVICE, "db")]),
        )];
        let filter = FilterSpec {
            exclude_names: vec!["^proj@".into()],
            ..Default::default()
        };
        assert!(filter.apply_client_side(records).is_empty());
    }

    #[test]
    fn test_exact_name_escapes() {
        let filter = FilterSpec::exact_name("a.b");
        assert_eq!(filter.names, vec![r"^a\.b$"]);
    }

    #[rstest]
    #[case("nginx", "docker.io/library/nginx")]
    #[case("nginx:1.25", "docker.io/library/nginx:1.25")]
    #[case("docker.io/nginx", "docker.io/library/nginx")]
    #[case("grafana/grafana", "docker.io/grafana/grafana")]
    #[case("ghcr.io/thin-edge/tedge:latest", "ghcr.io/thin-edge/tedge:latest")]
    #[case("localhost/app", "localhost/app")]
    #[case("registry:5000/app", "registry:5000/app")]
    fn test_normalize_image_ref(#[case] image: &str, #[case] expected: &str) {
        assert_eq!(normalize_image_ref(image), expected);
    }

    #[test]
    fn test_image_domain() {
        assert_eq!(image_domain("nginx"), "docker.io");
        assert_eq!(image_domain("ghcr.io/a/b"), "ghcr.io");
    }

    #[test]
    fn test_telemetry_rounding() {
        let stats = ContainerStats {
            cpu_percent: 1.23456,
            memory_percent: 50.0,
            net_tx: 1024.7,
        };
        let payload = stats.telemetry();
        assert_eq!(payload["container"]["cpu"], 1.23);
        assert_eq!(payload["container"]["memory"], 50.0);
        assert_eq!(payload["container"]["netio"], 1025.0);
    }

    #[rstest]
    #[case(0, "0B")]
    #[case(999, "999B")]
    #[case(1500, "1.5kB")]
    #[case(12_345_678, "12.3MB")]
    fn test_human_size(#[case] bytes: i64, #[case] expected: &str) {
        assert_eq!(human_size(bytes), expected);
    }
}

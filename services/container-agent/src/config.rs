//! Configuration for the container agent.
//!
//! Values are layered: built-in defaults, then a TOML file, then
//! `CONTAINER_<SECTION>_<KEY>` environment variables, then CLI flags
//! (applied by the command that owns them).

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::engine::FilterSpec;
use crate::error::AgentError;
use crate::registry::Target;

/// Config file used when none is given and `TEDGE_CONFIG_DIR` has none.
pub const LINUX_CONFIG_FILE: &str = "/etc/tedge-container-plugin/config.toml";

/// Metrics are never published more often than this.
pub const MIN_METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the agent's own service entity.
    pub service_name: String,

    /// MQTT topic root.
    pub topic_root: String,

    /// Topic id of the device the containers belong to.
    pub topic_id: String,

    /// Cloud identity of the device, used to build external ids.
    pub device_id: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Candidate persistent directories, first writable wins.
    pub data_dir: Vec<String>,

    pub filter: FilterConfig,
    pub metrics: MetricsConfig,
    pub events: EventsConfig,
    pub delete_from_cloud: DeleteFromCloudConfig,
    pub client: ClientConfig,
    pub container: ContainerConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub include: IncludeFilter,
    pub exclude: ExcludeFilter,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IncludeFilter {
    pub names: Vec<String>,
    pub labels: Vec<String>,
    pub ids: Vec<String>,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExcludeFilter {
    /// Regular expressions matched against container names.
    pub names: Vec<String>,
    /// Containers carrying any of these label keys are ignored.
    pub labels: Vec<String>,
}

impl Default for ExcludeFilter {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            labels: vec!["tedge.ignore".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Humantime duration, e.g. `300s` or `5m`.
    pub interval: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "300s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeleteFromCloudConfig {
    pub enabled: bool,
    /// Also delete cloud services that have no local entity.
    pub orphans: bool,
}

impl Default for DeleteFromCloudConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            orphans: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub host: String,
    /// 0 selects the protocol default.
    pub port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub http: Endpoint,
    pub mqtt: Endpoint,
    pub c8y: Endpoint,
    pub key: String,
    pub cert_file: String,
    pub ca_file: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            mqtt: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            c8y: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 8001,
            },
            key: String::new(),
            cert_file: String::new(),
            ca_file: String::new(),
        }
    }
}

impl ClientConfig {
    /// Client certificate and key both exist on disk.
    pub fn use_certs(&self) -> bool {
        !self.key.is_empty()
            && !self.cert_file.is_empty()
            && Path::new(&self.key).exists()
            && Path::new(&self.cert_file).exists()
    }

    pub fn mqtt_port(&self) -> u16 {
        match self.mqtt.port {
            0 if self.use_certs() => 8883,
            0 => 1883,
            port => port,
        }
    }

    pub fn http_base_url(&self) -> String {
        let scheme = if self.use_certs() { "https" } else { "http" };
        let port = if self.http.port == 0 { 8000 } else { self.http.port };
        format!("{}://{}:{}", scheme, self.http.host, port)
    }

    pub fn c8y_base_url(&self) -> String {
        let scheme = if self.use_certs() { "https" } else { "http" };
        let port = if self.c8y.port == 0 { 8001 } else { self.c8y.port };
        format!("{}://{}:{}/c8y", scheme, self.c8y.host, port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Shared network all managed containers join.
    pub network: String,
    /// Pull even when the image exists locally.
    pub always_pull: bool,
    /// Prune unused images in `finalize`.
    pub prune_images: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            network: "tedge".to_string(),
            always_pull: false,
            prune_images: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// TOML file with `registry1`..`registry4` credential tables.
    pub credentials_path: String,
    /// Executable called as `<script> get <image> [--refresh]`.
    pub credentials_script: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            credentials_path: "/data/tedge-container-plugin/credentials.toml".to_string(),
            credentials_script: "registry-credentials".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "tedge-container-plugin".to_string(),
            topic_root: "te".to_string(),
            topic_id: "device/main//".to_string(),
            device_id: String::new(),
            log_level: "info".to_string(),
            data_dir: vec![
                "/data/tedge-container-plugin".to_string(),
                "/var/tedge-container-plugin".to_string(),
            ],
            filter: FilterConfig::default(),
            metrics: MetricsConfig::default(),
            events: EventsConfig::default(),
            delete_from_cloud: DeleteFromCloudConfig::default(),
            client: ClientConfig::default(),
            container: ContainerConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl Config {
    /// Load defaults, the config file (if any) and environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        let mut config = match Self::resolve_file(path) {
            Some(file) => {
                info!(path = %file.display(), "Using config file");
                Self::from_file(&file)?
            }
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e)))
    }

    fn resolve_file(path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = path {
            return path.exists().then(|| path.to_path_buf());
        }

        let config_dir = std::env::var("TEDGE_CONFIG_DIR").unwrap_or_else(|_| "/etc/tedge".into());
        [
            Path::new(&config_dir).join("plugins").join("tedge-container-plugin.toml"),
            PathBuf::from(LINUX_CONFIG_FILE),
        ]
        .into_iter()
        .find(|p| p.exists())
    }

    /// Apply `CONTAINER_*` overrides. Unknown keys are ignored. List values
    /// are comma separated.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), AgentError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(key) = key.strip_prefix("CONTAINER_") else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            match key.as_str() {
                "service_name" => self.service_name = value,
                "topic_root" => self.topic_root = value,
                "topic_id" => self.topic_id = value,
                "device_id" => self.device_id = value,
                "log_level" => self.log_level = value,
                "data_dir" => self.data_dir = split_list(&value),
                "filter_include_names" => self.filter.include.names = split_list(&value),
                "filter_include_labels" => self.filter.include.labels = split_list(&value),
                "filter_include_ids" => self.filter.include.ids = split_list(&value),
                "filter_include_types" => self.filter.include.types = split_list(&value),
                "filter_exclude_names" => self.filter.exclude.names = split_list(&value),
                "filter_exclude_labels" => self.filter.exclude.labels = split_list(&value),
                "metrics_enabled" => self.metrics.enabled = parse_bool(&key, &value)?,
                "metrics_interval" => self.metrics.interval = value,
                "events_enabled" => self.events.enabled = parse_bool(&key, &value)?,
                "delete_from_cloud_enabled" => {
                    self.delete_from_cloud.enabled = parse_bool(&key, &value)?
                }
                "delete_from_cloud_orphans" => {
                    self.delete_from_cloud.orphans = parse_bool(&key, &value)?
                }
                "client_http_host" => self.client.http.host = value,
                "client_http_port" => self.client.http.port = parse_port(&key, &value)?,
                "client_mqtt_host" => self.client.mqtt.host = value,
                "client_mqtt_port" => self.client.mqtt.port = parse_port(&key, &value)?,
                "client_c8y_host" => self.client.c8y.host = value,
                "client_c8y_port" => self.client.c8y.port = parse_port(&key, &value)?,
                "client_key" => self.client.key = value,
                "client_cert_file" => self.client.cert_file = value,
                "client_ca_file" => self.client.ca_file = value,
                "container_network" => self.container.network = value,
                "container_always_pull" => self.container.always_pull = parse_bool(&key, &value)?,
                "container_prune_images" => {
                    self.container.prune_images = parse_bool(&key, &value)?
                }
                "registry_credentials_path" => self.registry.credentials_path = value,
                "registry_credentials_script" => self.registry.credentials_script = value,
                _ => debug!(key = %key, "Ignoring unknown environment override"),
            }
        }
        Ok(())
    }

    /// Metrics interval, clamped to [`MIN_METRICS_INTERVAL`].
    pub fn metrics_interval(&self) -> Result<Duration, AgentError> {
        let interval = humantime::parse_duration(&self.metrics.interval).map_err(|e| {
            AgentError::Config(format!("metrics.interval '{}': {}", self.metrics.interval, e))
        })?;
        if interval < MIN_METRICS_INTERVAL {
            warn!(
                old = ?interval,
                new = ?MIN_METRICS_INTERVAL,
                "metrics.interval is lower than allowed limit"
            );
            return Ok(MIN_METRICS_INTERVAL);
        }
        Ok(interval)
    }

    /// Filter built from the `filter` section.
    pub fn filter_spec(&self) -> FilterSpec {
        FilterSpec {
            names: self.filter.include.names.clone(),
            labels: self.filter.include.labels.clone(),
            ids: self.filter.include.ids.clone(),
            types: self.filter.include.types.clone(),
            exclude_names: self.filter.exclude.names.clone(),
            exclude_with_label: self.filter.exclude.labels.clone(),
        }
    }

    /// The device the managed containers belong to.
    pub fn device_target(&self) -> Target {
        Target::new(&self.topic_root, &self.topic_id).with_cloud_identity(&self.device_id)
    }

    /// First usable persistent directory.
    ///
    /// Candidates are the configured data dirs plus `<tmp>/<service_name>`.
    /// A candidate is usable when its root exists and, if `check_writable`
    /// is set, it can be created and written to.
    pub fn persistent_dir(&self, check_writable: bool) -> Result<PathBuf, AgentError> {
        let candidates: Vec<PathBuf> = self
            .data_dir
            .iter()
            .map(PathBuf::from)
            .chain(std::iter::once(std::env::temp_dir().join(&self.service_name)))
            .filter(|p| root_dir(p).exists())
            .collect();

        if candidates.is_empty() {
            return Err(AgentError::Config(
                "could not find working directory from an existing root dir".into(),
            ));
        }

        if !check_writable {
            return Ok(candidates[0].clone());
        }

        for dir in candidates {
            if is_dir_writable(&dir) {
                return Ok(dir);
            }
            info!(dir = %dir.display(), "Skipping dir as it is not writable");
        }
        Err(AgentError::Config("no writable working directory detected".into()))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AgentError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AgentError::Config(format!("{}: invalid boolean '{}'", key, value))),
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, AgentError> {
    value
        .trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("{}: invalid port '{}'", key, value)))
}

/// Top-most directory of an absolute path (`/data` for `/data/a/b`).
fn root_dir(path: &Path) -> PathBuf {
    let mut root = PathBuf::new();
    for component in path.components() {
        root.push(component);
        if matches!(component, Component::Normal(_)) {
            break;
        }
    }
    root
}

fn is_dir_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".write-test");
    let ok = std::fs::write(&probe, b"").is_ok();
    let _ = std::fs::remove_file(&probe);
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.service_name, "tedge-container-plugin");
        assert_eq!(config.topic_root, "te");
        assert_eq!(config.topic_id, "device/main//");
        assert_eq!(config.filter.exclude.labels, vec!["tedge.ignore"]);
        assert_eq!(config.container.network, "tedge");
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics_interval().unwrap(), Duration::from_secs(300));
        assert_eq!(config.client.mqtt_port(), 1883);
        assert_eq!(config.client.http_base_url(), "http://127.0.0.1:8000");
        assert_eq!(config.client.c8y_base_url(), "http://127.0.0.1:8001/c8y");
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
service_name = "containers"
device_id = "rpi-001"

[filter.exclude]
names = ["^tmp-.*"]

[metrics]
interval = "10m"

[client.mqtt]
host = "broker"
port = 1884
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.service_name, "containers");
        assert_eq!(config.device_id, "rpi-001");
        assert_eq!(config.filter.exclude.names, vec!["^tmp-.*"]);
        // untouched keys in a partially specified table keep their defaults
        assert_eq!(config.filter.exclude.labels, vec!["tedge.ignore"]);
        assert_eq!(config.metrics_interval().unwrap(), Duration::from_secs(600));
        assert_eq!(config.client.mqtt.host, "broker");
        assert_eq!(config.client.mqtt_port(), 1884);
        assert_eq!(config.topic_root, "te");
    }

    #[test]
    fn test_partial_endpoint_table() {
        let config: Config = toml::from_str(
            r#"
[client.http]
port = 9000

[client.c8y]
host = "10.0.0.5"
"#,
        )
        .unwrap();
        assert_eq!(config.client.http_base_url(), "http://127.0.0.1:9000");
        assert_eq!(config.client.c8y.host, "10.0.0.5");
        assert_eq!(config.client.c8y_base_url(), "http://10.0.0.5:8001/c8y");
        assert_eq!(config.client.mqtt_port(), 1883);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("CONTAINER_METRICS_ENABLED", "false"),
                ("CONTAINER_FILTER_INCLUDE_NAMES", "app1, app2"),
                ("CONTAINER_CLIENT_HTTP_PORT", "9000"),
                ("CONTAINER_UNKNOWN", "x"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();

        assert!(!config.metrics.enabled);
        assert_eq!(config.filter.include.names, vec!["app1", "app2"]);
        assert_eq!(config.client.http.port, 9000);
    }

    #[test]
    fn test_env_invalid_bool() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("CONTAINER_EVENTS_ENABLED", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_metrics_interval_floor() {
        let mut config = Config::default();
        config.metrics.interval = "5s".into();
        assert_eq!(config.metrics_interval().unwrap(), MIN_METRICS_INTERVAL);
    }

    #[test]
    fn test_filter_spec_from_config() {
        let mut config = Config::default();
        config.filter.include.types = vec!["container".into()];
        let filter = config.filter_spec();
        assert!(filter.is_empty());
        assert_eq!(filter.types, vec!["container"]);
        assert_eq!(filter.exclude_with_label, vec!["tedge.ignore"]);
    }

    #[test]
    fn test_persistent_dir_prefers_first_writable() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let mut config = Config::default();
        config.data_dir = vec![first.display().to_string()];

        let chosen = config.persistent_dir(true).unwrap();
        assert_eq!(chosen, first);
        assert!(first.is_dir());
    }

    #[test]
    fn test_persistent_dir_skips_missing_roots() {
        let mut config = Config::default();
        config.service_name = "tedge-container-test".into();
        config.data_dir = vec!["/nonexistent-root-for-test/data".into()];

        let chosen = config.persistent_dir(false).unwrap();
        assert_eq!(chosen, std::env::temp_dir().join("tedge-container-test"));
    }

    #[test]
    fn test_root_dir() {
        assert_eq!(root_dir(Path::new("/data/a/b")), PathBuf::from("/data"));
        assert_eq!(root_dir(Path::new("/")), PathBuf::from("/"));
    }
}

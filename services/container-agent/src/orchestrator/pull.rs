//! Image pulls with bounded retries and registry credentials.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::find_executable;
use crate::config::RegistryConfig;
use crate::engine::{image_domain, ContainerEngine, RegistryAuth};
use crate::error::AgentError;

/// Number of `registryN` tables read from the credentials file.
const REGISTRY_SLOTS: usize = 4;

/// Upper bound on a credentials script run.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry behaviour for a pull.
#[derive(Debug, Clone)]
pub struct PullPolicy {
    /// Pull even if the image already exists locally.
    pub always_pull: bool,
    pub attempts: u32,
    /// Delay between attempts.
    pub wait: Duration,
}

impl Default for PullPolicy {
    fn default() -> Self {
        Self {
            always_pull: false,
            attempts: 2,
            wait: Duration::from_secs(5),
        }
    }
}

/// Supplies registry credentials for each pull attempt.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Credentials for `image`. `attempt` starts at 1; later attempts may
    /// ask the source to refresh cached credentials.
    async fn credentials(&self, image: &str, attempt: u32) -> Option<RegistryAuth>;
}

/// Anonymous pulls.
pub struct NoCredentials;

#[async_trait]
impl CredentialSource for NoCredentials {
    async fn credentials(&self, _image: &str, _attempt: u32) -> Option<RegistryAuth> {
        None
    }
}

/// Pull `image` unless it is already present.
///
/// The image is checked after every pull because some engines report
/// success even when registry authentication failed.
pub async fn pull_image(
    engine: &dyn ContainerEngine,
    image: &str,
    policy: &PullPolicy,
    credentials: &dyn CredentialSource,
) -> Result<(), AgentError> {
    match engine.image_id(image).await {
        Ok(Some(id)) if !policy.always_pull => {
            info!(image = %image, id = %id, "Image already exists");
            return Ok(());
        }
        Ok(_) => {}
        Err(e) => info!(image = %image, error = %e, "Image does not already exist, trying to pull image"),
    }

    let attempts = policy.attempts.max(1);
    let mut reason = String::new();
    for attempt in 1..=attempts {
        info!(image = %image, attempt, "Pulling image");
        let auth = credentials
            .credentials(image, attempt)
            .await
            .filter(RegistryAuth::is_set);

        match engine.pull(image, auth.as_ref()).await {
            Ok(()) => match engine.image_id(image).await {
                Ok(Some(id)) => {
                    info!(image = %image, id = %id, "Image found after pull");
                    return Ok(());
                }
                Ok(None) => reason = "no image found after pulling".to_string(),
                Err(e) => reason = e.to_string(),
            },
            Err(e) => reason = e.to_string(),
        }

        warn!(image = %image, attempt, error = %reason, "Pull attempt failed");
        if attempt < attempts {
            tokio::time::sleep(policy.wait).await;
        }
    }

    Err(AgentError::PullFailed {
        image: image.to_string(),
        attempts,
        reason,
    })
}

// =============================================================================
// Registry credentials
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CredentialEntry {
    repo: String,
    username: String,
    password: String,
}

/// Credentials from the `registry1`..`registry4` tables of a TOML file
/// (overridable with `CONTAINER_REGISTRY<N>_<KEY>`). An external helper
/// invoked as `<script> get <image> [--refresh]` overrides the username and
/// password when it prints both.
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    path: PathBuf,
    script: String,
    script_timeout: Duration,
    env: Vec<(String, String)>,
}

impl RegistryCredentials {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            path: PathBuf::from(&config.credentials_path),
            script: config.credentials_script.clone(),
            script_timeout: SCRIPT_TIMEOUT,
            env: std::env::vars()
                .filter(|(k, _)| k.starts_with("CONTAINER_REGISTRY"))
                .collect(),
        }
    }

    /// Replace the environment the overrides are read from.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }

    /// Credentials from the file for the registry hosting `image`.
    pub fn from_file(&self, image: &str) -> Option<RegistryAuth> {
        let mut entries = read_entries(&self.path);
        apply_env(&mut entries, &self.env);

        let domain = image_domain(image);
        info!(url = %domain, image = %image, "Looking for credentials matching repository");
        let entry = (1..=REGISTRY_SLOTS)
            .filter_map(|i| entries.get(&format!("registry{}", i)))
            .find(|e| e.repo.eq_ignore_ascii_case(&domain) && !e.username.is_empty())?;

        info!(url = %entry.repo, username = %entry.username, "Found container registry credentials");
        Some(RegistryAuth {
            server: entry.repo.clone(),
            username: entry.username.clone(),
            password: entry.password.clone(),
        })
    }

    /// Credentials printed as JSON by the helper script.
    pub async fn from_script(&self, image: &str, attempt: u32) -> Result<Option<RegistryAuth>, AgentError> {
        let Some(script) = find_executable(&self.script) else {
            return Ok(None);
        };

        let mut command = tokio::process::Command::new(&script);
        command.arg("get").arg(image).kill_on_drop(true);
        if attempt > 1 {
            command.arg("--refresh");
        }
        info!(cmd = %script.display(), image = %image, attempt, "Executing credentials plugin");

        let output = tokio::time::timeout(self.script_timeout, command.output())
            .await
            .map_err(|_| AgentError::Timeout {
                what: format!("credentials script {}", script.display()),
                elapsed: self.script_timeout,
            })??;
        if !output.status.success() {
            return Err(AgentError::Registry(format!(
                "credentials script exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let mut auth: RegistryAuth = serde_json::from_slice(&output.stdout)
            .map_err(|e| AgentError::Registry(format!("invalid credentials script output: {}", e)))?;
        if auth.server.is_empty() {
            auth.server = image_domain(image);
        }
        Ok(Some(auth))
    }
}

#[async_trait]
impl CredentialSource for RegistryCredentials {
    async fn credentials(&self, image: &str, attempt: u32) -> Option<RegistryAuth> {
        let from_file = self.from_file(image);
        match self.from_script(image, attempt).await {
            Ok(Some(auth)) if auth.is_set() => {
                info!(username = %auth.username, "Using registry credentials returned by a helper");
                Some(match from_file {
                    Some(file) => RegistryAuth {
                        username: auth.username,
                        password: auth.password,
                        ..file
                    },
                    None => auth,
                })
            }
            Ok(_) => from_file,
            Err(e) => {
                warn!(image = %image, error = %e, "Could not get credentials from script");
                from_file
            }
        }
    }
}

fn read_entries(path: &Path) -> BTreeMap<String, CredentialEntry> {
    if !path.exists() {
        return BTreeMap::new();
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|contents| toml::from_str(&contents).map_err(|e| e.to_string()));
    match parsed {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read credentials file. Continuing anyway");
            BTreeMap::new()
        }
    }
}

fn apply_env(entries: &mut BTreeMap<String, CredentialEntry>, env: &[(String, String)]) {
    for (key, value) in env {
        let Some(rest) = key.strip_prefix("CONTAINER_") else {
            continue;
        };
        let rest = rest.to_ascii_lowercase();
        let Some((slot, field)) = rest.split_once('_') else {
            continue;
        };
        if !slot.starts_with("registry") {
            continue;
        }
        let entry = entries.entry(slot.to_string()).or_default();
        match field {
            "repo" => entry.repo = value.clone(),
            "username" => entry.username = value.clone(),
            "password" => entry.password = value.clone(),
            _ => {}
        }
    }
}

//! Single containers managed as software packages: the module name is the
//! container name, the module version is the image reference.

use std::path::Path;
use std::sync::Arc;

use bollard::container::NetworkingConfig;
use bollard::models::{EndpointSettings, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use tracing::{info, warn};

use super::pull::{pull_image, CredentialSource, NoCredentials, PullPolicy};
use crate::engine::{
    self, normalize_image_ref, ContainerEngine, CreateConfig, FilterSpec, ServiceType,
};
use crate::error::AgentError;

/// Installs, removes and lists single containers.
pub struct ContainerPackages {
    engine: Arc<dyn ContainerEngine>,
    credentials: Arc<dyn CredentialSource>,
    pull_policy: PullPolicy,
    network: String,
}

impl ContainerPackages {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            credentials: Arc::new(NoCredentials),
            pull_policy: PullPolicy::default(),
            network: "tedge".to_string(),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    pub fn with_network(mut self, network: &str) -> Self {
        self.network = network.to_string();
        self
    }

    /// (Re)create container `name` from image `version`, returning its id.
    ///
    /// With `file`, the image is loaded from that archive and never pulled.
    pub async fn install(&self, name: &str, version: &str, file: Option<&Path>) -> Result<String, AgentError> {
        let mut image = version.to_string();

        if let Some(file) = file {
            info!(file = %file.display(), "Loading image from file");
            let loaded = self.engine.load_image(file).await?;
            image = select_loaded_image(&loaded, version).ok_or_else(|| {
                warn!(file = %file.display(), "No images detected in file. Aborting to avoid pulling from the network");
                AgentError::NotFound(format!(
                    "no image detected in file. name={}, version={}, file={}",
                    name,
                    version,
                    file.display()
                ))
            })?;
            if loaded.len() > 1 {
                warn!(file = %file.display(), images = ?loaded, "More than 1 image detected in file. Only using the first image");
            }
        }

        self.engine.ensure_network(&self.network).await?;

        if file.is_none() {
            pull_image(
                self.engine.as_ref(),
                &image,
                &self.pull_policy,
                self.credentials.as_ref(),
            )
            .await?;
        }

        engine::stop_remove(self.engine.as_ref(), name).await?;

        let mut endpoints = std::collections::HashMap::new();
        endpoints.insert(
            self.network.clone(),
            EndpointSettings {
                network_id: Some(self.network.clone()),
                ..Default::default()
            },
        );
        let config = CreateConfig {
            image: Some(image.clone()),
            labels: Some(Default::default()),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ALWAYS),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        let id = self.engine.create(name, config).await?;
        self.engine.start(&id).await?;
        info!(id = %id, name = %name, image = %image, "Created container");
        Ok(id)
    }

    /// Stop and remove container `name`. A missing container is fine.
    pub async fn remove(&self, name: &str) -> Result<(), AgentError> {
        engine::stop_remove(self.engine.as_ref(), name).await
    }

    /// `(name, normalized image)` of every single container matching
    /// `filter`. Group members are left to the group plugin.
    pub async fn list(&self, filter: &FilterSpec) -> Result<Vec<(String, String)>, AgentError> {
        Ok(engine::list(self.engine.as_ref(), filter)
            .await?
            .into_iter()
            .filter(|r| r.service_type == ServiceType::Container)
            .map(|r| (r.name, normalize_image_ref(&r.image)))
            .collect())
    }

    /// Prune unused images when enabled.
    pub async fn finalize(&self, prune_images: bool) -> Result<(), AgentError> {
        if !prune_images {
            info!("Image pruning is disabled");
            return Ok(());
        }
        info!("Pruning images");
        let removed = self.engine.prune_unused_images().await?;
        info!(count = removed, "Pruned unused images");
        Ok(())
    }
}

/// The loaded reference equal to `version`, else the first one loaded.
fn select_loaded_image(loaded: &[String], version: &str) -> Option<String> {
    loaded
        .iter()
        .find(|r| r.as_str() == version)
        .or_else(|| loaded.first())
        .cloned()
}

//! Registry interface: the thin-edge.io entity store, MQTT and the cloud.
//!
//! The reconciler only talks to [`Registry`]. [`TedgeRegistry`] is the
//! production adapter (HTTP entity API, MQTT broker, Cumulocity proxy);
//! [`MockRegistry`] records everything in memory.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

pub mod mock;
pub mod tedge;

pub use mock::MockRegistry;
pub use tedge::TedgeRegistry;

/// Topic id of the main device.
pub const MAIN_DEVICE_TOPIC_ID: &str = "device/main//";

pub const ENTITY_TYPE_SERVICE: &str = "service";

// =============================================================================
// Targets
// =============================================================================

/// An entity address: topic root, topic id and cloud identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub root: String,
    pub topic_id: String,
    pub cloud_identity: String,
}

impl Target {
    /// Target under `root` (`te` when empty).
    pub fn new(root: &str, topic_id: &str) -> Self {
        let root = if root.is_empty() { "te" } else { root };
        Self {
            root: root.to_string(),
            topic_id: topic_id.to_string(),
            cloud_identity: String::new(),
        }
    }

    pub fn with_cloud_identity(mut self, cloud_identity: &str) -> Self {
        self.cloud_identity = cloud_identity.to_string();
        self
    }

    /// Parse `<root>/<4 topic id segments>[/...]`.
    pub fn from_topic(topic: &str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 5 {
            return None;
        }
        Some(Self::new(parts[0], &parts[1..5].join("/")))
    }

    /// Service `name` of the device this target belongs to.
    pub fn service(&self, name: &str) -> Self {
        let device: Vec<&str> = self.topic_id.split('/').take(2).collect();
        Self {
            root: self.root.clone(),
            topic_id: format!("{}/service/{}", device.join("/"), name),
            cloud_identity: self.cloud_identity.clone(),
        }
    }

    /// Last topic id segment, e.g. the service name.
    pub fn name(&self) -> &str {
        self.topic_id.rsplit('/').next().unwrap_or_default()
    }

    pub fn topic(&self) -> String {
        format!("{}/{}", self.root, self.topic_id)
    }

    /// `<root>/<topic id>/<subpath...>`.
    pub fn topic_with(&self, subpath: &[&str]) -> String {
        if subpath.is_empty() {
            return self.topic();
        }
        format!("{}/{}/{}", self.root, self.topic_id, subpath.join("/"))
    }

    pub fn health_topic(&self) -> String {
        self.topic_with(&["status", "health"])
    }

    /// Cloud external id: the device's identity for the main device,
    /// otherwise the identity and topic id joined with `:`.
    pub fn external_id(&self) -> String {
        if self.topic_id == MAIN_DEVICE_TOPIC_ID {
            return self.cloud_identity.clone();
        }
        format!("{}:{}", self.cloud_identity, self.topic_id.replace('/', ":"))
            .trim_end_matches(':')
            .to_string()
    }
}

// =============================================================================
// Entities
// =============================================================================

/// Entity as exchanged with the entity store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "@id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "@type", default, skip_serializing_if = "String::is_empty")]
    pub entity_type: String,
    #[serde(rename = "@topic-id", default, skip_serializing_if = "String::is_empty")]
    pub topic_id: String,
    #[serde(rename = "@parent", default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Service type, e.g. `container` or `container-group`.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub service_type: String,
}

impl Entity {
    /// Service entity for `target`, child of `parent`.
    pub fn service(target: &Target, parent: &Target, name: &str, service_type: &str) -> Self {
        Self {
            entity_type: ENTITY_TYPE_SERVICE.to_string(),
            topic_id: target.topic_id.clone(),
            parent: parent.topic_id.clone(),
            name: name.to_string(),
            service_type: service_type.to_string(),
            ..Default::default()
        }
    }
}

/// A service object held by the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudService {
    /// Cloud object id.
    pub id: String,
    pub name: String,
    pub service_type: String,
}

// =============================================================================
// Registry trait
// =============================================================================

/// Registry interface.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Publish a JSON message (QoS 1).
    async fn publish(
        &self,
        topic: &str,
        retained: bool,
        payload: &serde_json::Value,
    ) -> Result<(), AgentError>;

    /// Registered entities keyed by topic id, with their service type.
    async fn list_entities(&self) -> Result<HashMap<String, Entity>, AgentError>;

    /// Register an entity. Registering an existing entity is not an error.
    async fn register(&self, entity: &Entity) -> Result<(), AgentError>;

    /// Replace the twin fragment `fragment` of `target`.
    async fn update_twin(
        &self,
        target: &Target,
        fragment: &str,
        value: &serde_json::Value,
    ) -> Result<(), AgentError>;

    /// Remove an entity and its retained messages.
    async fn deregister(&self, target: &Target) -> Result<(), AgentError>;

    /// Delete the cloud object for `target` by external id.
    /// Returns `false` when there was nothing to delete.
    async fn delete_remote_object(&self, target: &Target) -> Result<bool, AgentError>;

    async fn has_entity(&self, target: &Target) -> Result<bool, AgentError>;

    /// Ask the agent to refresh its log types.
    async fn sync_log_types(&self) -> Result<(), AgentError>;

    /// Container services the cloud holds for `device`.
    async fn list_cloud_services(&self, device: &Target) -> Result<Vec<CloudService>, AgentError>;

    /// Delete a cloud object by id.
    async fn delete_cloud_object(&self, id: &str) -> Result<(), AgentError>;
}

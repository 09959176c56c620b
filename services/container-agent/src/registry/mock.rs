//! In-memory registry for tests and development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CloudService, Entity, Registry, Target};
use crate::error::AgentError;

/// A message published through [`MockRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub retained: bool,
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct RegistryState {
    entities: HashMap<String, Entity>,
    published: Vec<Published>,
    registered: Vec<Entity>,
    twins: HashMap<(String, String), serde_json::Value>,
    deregistered: Vec<String>,
    remote_deleted: Vec<String>,
    cloud_services: Vec<CloudService>,
    cloud_deleted: Vec<String>,
    log_syncs: usize,
    fail_registrations: bool,
}

/// In-memory registry. Registering adds to the entity store and
/// deregistering removes from it.
#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<RegistryState>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed the entity store.
    pub fn add_entity(&self, entity: Entity) {
        self.lock().entities.insert(entity.topic_id.clone(), entity);
    }

    /// Seed a cloud service.
    pub fn add_cloud_service(&self, id: &str, name: &str, service_type: &str) {
        self.lock().cloud_services.push(CloudService {
            id: id.to_string(),
            name: name.to_string(),
            service_type: service_type.to_string(),
        });
    }

    pub fn fail_registrations(&self) {
        self.lock().fail_registrations = true;
    }

    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().entities.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Messages published to topics ending with `suffix`.
    pub fn published_to(&self, suffix: &str) -> Vec<Published> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.topic.ends_with(suffix))
            .cloned()
            .collect()
    }

    pub fn registered(&self) -> Vec<Entity> {
        self.lock().registered.clone()
    }

    pub fn twin(&self, topic_id: &str, fragment: &str) -> Option<serde_json::Value> {
        self.lock()
            .twins
            .get(&(topic_id.to_string(), fragment.to_string()))
            .cloned()
    }

    /// Topic ids passed to `deregister`, in call order.
    pub fn deregistered(&self) -> Vec<String> {
        self.lock().deregistered.clone()
    }

    /// External ids passed to `delete_remote_object`, in call order.
    pub fn remote_deleted(&self) -> Vec<String> {
        self.lock().remote_deleted.clone()
    }

    pub fn cloud_deleted(&self) -> Vec<String> {
        self.lock().cloud_deleted.clone()
    }

    pub fn log_syncs(&self) -> usize {
        self.lock().log_syncs
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn publish(
        &self,
        topic: &str,
        retained: bool,
        payload: &serde_json::Value,
    ) -> Result<(), AgentError> {
        self.lock().published.push(Published {
            topic: topic.to_string(),
            retained,
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn list_entities(&self) -> Result<HashMap<String, Entity>, AgentError> {
        Ok(self.lock().entities.clone())
    }

    async fn register(&self, entity: &Entity) -> Result<(), AgentError> {
        let mut state = self.lock();
        if state.fail_registrations {
            return Err(AgentError::Registry("registration rejected".into()));
        }
        state.registered.push(entity.clone());
        state.entities.insert(entity.topic_id.clone(), entity.clone());
        Ok(())
    }

    async fn update_twin(
        &self,
        target: &Target,
        fragment: &str,
        value: &serde_json::Value,
    ) -> Result<(), AgentError> {
        self.lock()
            .twins
            .insert((target.topic_id.clone(), fragment.to_string()), value.clone());
        Ok(())
    }

    async fn deregister(&self, target: &Target) -> Result<(), AgentError> {
        let mut state = self.lock();
        state.deregistered.push(target.topic_id.clone());
        state.entities.remove(&target.topic_id);
        Ok(())
    }

    async fn delete_remote_object(&self, target: &Target) -> Result<bool, AgentError> {
        self.lock().remote_deleted.push(target.external_id());
        Ok(true)
    }

    async fn has_entity(&self, target: &Target) -> Result<bool, AgentError> {
        Ok(self.lock().entities.contains_key(&target.topic_id))
    }

    async fn sync_log_types(&self) -> Result<(), AgentError> {
        self.lock().log_syncs += 1;
        Ok(())
    }

    async fn list_cloud_services(&self, _device: &Target) -> Result<Vec<CloudService>, AgentError> {
        Ok(self.lock().cloud_services.clone())
    }

    async fn delete_cloud_object(&self, id: &str) -> Result<(), AgentError> {
        let mut state = self.lock();
        state.cloud_deleted.push(id.to_string());
        state.cloud_services.retain(|s| s.id != id);
        Ok(())
    }
}

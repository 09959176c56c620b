//! thin-edge.io registry adapter.
//!
//! - Entity store and twin over the local HTTP API (`/te/v1/entities`)
//! - Retained health, events and measurements over MQTT
//! - Cloud object cleanup through the Cumulocity proxy (`/c8y`)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
    Transport,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{CloudService, Entity, Registry, Target};
use crate::config::ClientConfig;
use crate::error::AgentError;

/// Service types the cloud holds for managed containers.
const CLOUD_SERVICE_QUERY: &str =
    "type eq 'c8y_Service' and (serviceType eq 'container' or serviceType eq 'container-group')";

/// Delay between MQTT reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Registry backed by the thin-edge.io HTTP API, MQTT broker and Cumulocity proxy.
pub struct TedgeRegistry {
    http: reqwest::Client,
    base_url: String,
    c8y_url: String,
    mqtt: AsyncClient,
    /// The agent's own service.
    service: Target,
}

/// Drives the MQTT connection and routes health-check commands.
pub struct MqttSession {
    eventloop: EventLoop,
    client: AsyncClient,
    service: Target,
    health_checks: mpsc::Sender<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalId {
    #[serde(rename = "managedObject")]
    managed_object: ManagedObjectRef,
}

#[derive(Debug, Deserialize)]
struct ManagedObjectRef {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "serviceType", default)]
    service_type: String,
}

#[derive(Debug, Deserialize)]
struct ChildAdditions {
    #[serde(default)]
    references: Vec<ChildReference>,
}

#[derive(Debug, Deserialize)]
struct ChildReference {
    #[serde(rename = "managedObject")]
    managed_object: ManagedObjectRef,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    #[serde(rename = "userName")]
    user_name: String,
}

impl TedgeRegistry {
    /// Create the HTTP and MQTT clients for `service`.
    ///
    /// Nothing is connected until the returned [`MqttSession`] runs.
    /// Health-check requests are sent to `health_checks` as service names.
    pub fn new(
        config: &ClientConfig,
        service: Target,
        health_checks: mpsc::Sender<String>,
    ) -> Result<(Self, MqttSession), AgentError> {
        let http = build_http_client(config)?;
        let options = mqtt_options(config, &service)?;
        let (mqtt, eventloop) = AsyncClient::new(options, 64);

        info!(
            http = %config.http_base_url(),
            c8y = %config.c8y_base_url(),
            mqtt_host = %config.mqtt.host,
            mqtt_port = config.mqtt_port(),
            "Created thin-edge.io clients"
        );

        let registry = Self {
            http,
            base_url: config.http_base_url(),
            c8y_url: config.c8y_base_url(),
            mqtt: mqtt.clone(),
            service: service.clone(),
        };
        let session = MqttSession {
            eventloop,
            client: mqtt,
            service,
            health_checks,
        };
        Ok((registry, session))
    }

    fn entities_url(&self, topic_id: Option<&str>) -> String {
        match topic_id {
            Some(topic_id) => format!("{}/te/v1/entities/{}", self.base_url, topic_id),
            None => format!("{}/te/v1/entities", self.base_url),
        }
    }

    /// Device identity as known by the cloud, read from the proxy's current user.
    pub async fn lookup_cloud_identity(&self) -> Result<String, AgentError> {
        let url = format!("{}/user/currentUser", self.c8y_url);
        let response = check_status(self.http.get(&url).send().await?, &[], "get current user").await?;
        let user: CurrentUser = response.json().await?;
        Ok(user
            .user_name
            .strip_prefix("device_")
            .unwrap_or(&user.user_name)
            .to_string())
    }

    /// Register the agent's own service under `device`.
    pub async fn register_self(&self, device: &Target) -> Result<(), AgentError> {
        let entity = Entity::service(&self.service, device, self.service.name(), "");
        self.register(&entity).await?;
        info!(topic = %self.service.topic(), "Registered service");
        Ok(())
    }

    /// Disconnect cleanly so the last will is not sent.
    pub async fn disconnect(&self) -> Result<(), AgentError> {
        self.mqtt.disconnect().await?;
        Ok(())
    }

    async fn managed_object_id(&self, external_id: &str) -> Result<Option<String>, AgentError> {
        let url = format!("{}/identity/externalIds/c8y_Serial/{}", self.c8y_url, external_id);
        let response = self.http.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, &[], "get external id").await?;
        let ext: ExternalId = response.json().await?;
        Ok(Some(ext.managed_object.id))
    }
}

#[async_trait]
impl Registry for TedgeRegistry {
    async fn publish(
        &self,
        topic: &str,
        retained: bool,
        payload: &serde_json::Value,
    ) -> Result<(), AgentError> {
        info!(topic = %topic, payload = %payload, retained, "Publishing MQTT message");
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| AgentError::Registry(format!("encode payload: {}", e)))?;
        self.mqtt
            .publish(topic, QoS::AtLeastOnce, retained, bytes)
            .await?;
        Ok(())
    }

    async fn list_entities(&self) -> Result<HashMap<String, Entity>, AgentError> {
        let response = check_status(
            self.http.get(self.entities_url(None)).send().await?,
            &[],
            "list entities",
        )
        .await?;
        let entities: Vec<Entity> = response.json().await?;

        let mut by_topic = HashMap::with_capacity(entities.len());
        for mut entity in entities {
            let url = format!("{}/twin", self.entities_url(Some(&entity.topic_id)));
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    if let Ok(twin) = response.json::<serde_json::Value>().await {
                        if let Some(service_type) = twin.get("type").and_then(|t| t.as_str()) {
                            entity.service_type = service_type.to_string();
                        }
                    }
                    by_topic.insert(entity.topic_id.clone(), entity);
                }
                Ok(response) => {
                    debug!(topic_id = %entity.topic_id, status = %response.status(), "Skipping entity without twin");
                }
                Err(e) => {
                    debug!(topic_id = %entity.topic_id, error = %e, "Could not read entity twin");
                }
            }
        }
        Ok(by_topic)
    }

    async fn register(&self, entity: &Entity) -> Result<(), AgentError> {
        debug!(topic_id = %entity.topic_id, "Registering entity by http api");
        let response = self.http.post(self.entities_url(None)).json(entity).send().await?;
        check_status(response, &[StatusCode::CONFLICT], "register entity").await?;
        Ok(())
    }

    async fn update_twin(
        &self,
        target: &Target,
        fragment: &str,
        value: &serde_json::Value,
    ) -> Result<(), AgentError> {
        let url = format!("{}/twin/{}", self.entities_url(Some(&target.topic_id)), fragment);
        let response = self.http.put(&url).json(value).send().await?;
        check_status(response, &[], "update twin").await?;
        Ok(())
    }

    async fn deregister(&self, target: &Target) -> Result<(), AgentError> {
        let response = self
            .http
            .delete(self.entities_url(Some(&target.topic_id)))
            .send()
            .await?;
        check_status(response, &[StatusCode::NOT_FOUND], "deregister entity").await?;
        Ok(())
    }

    async fn delete_remote_object(&self, target: &Target) -> Result<bool, AgentError> {
        let external_id = target.external_id();
        info!(external_id = %external_id, "Deleting service by external id");
        let Some(id) = self.managed_object_id(&external_id).await? else {
            return Ok(false);
        };
        self.delete_cloud_object(&id).await?;
        Ok(true)
    }

    async fn has_entity(&self, target: &Target) -> Result<bool, AgentError> {
        let response = self
            .http
            .get(self.entities_url(Some(&target.topic_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response, &[], "get entity").await?;
        Ok(true)
    }

    async fn sync_log_types(&self) -> Result<(), AgentError> {
        let topic = self.service.service("tedge-agent").topic_with(&["signal", "sync"]);
        self.publish(&topic, false, &json!({})).await
    }

    async fn list_cloud_services(&self, device: &Target) -> Result<Vec<CloudService>, AgentError> {
        let Some(device_id) = self.managed_object_id(&device.external_id()).await? else {
            warn!(external_id = %device.external_id(), "Could not find the device's cloud object");
            return Ok(Vec::new());
        };

        let url = format!("{}/inventory/managedObjects/{}/childAdditions", self.c8y_url, device_id);
        let response = self
            .http
            .get(&url)
            .query(&[("query", CLOUD_SERVICE_QUERY), ("pageSize", "100")])
            .send()
            .await?;
        let response = check_status(response, &[], "list cloud services").await?;
        let additions: ChildAdditions = response.json().await?;

        Ok(additions
            .references
            .into_iter()
            .map(|r| CloudService {
                id: r.managed_object.id,
                name: r.managed_object.name,
                service_type: r.managed_object.service_type,
            })
            .collect())
    }

    async fn delete_cloud_object(&self, id: &str) -> Result<(), AgentError> {
        let url = format!("{}/inventory/managedObjects/{}", self.c8y_url, id);
        let response = self.http.delete(&url).send().await?;
        check_status(response, &[], "delete managed object").await?;
        Ok(())
    }
}

impl MqttSession {
    /// Poll the connection until shutdown or a clean disconnect.
    ///
    /// On every (re)connect the health-check topic is subscribed and the
    /// service's health is published as `up`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let health_check_topic = self
            .service
            .service("+")
            .topic_with(&["cmd", "health", "check"]);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("MQTT session shutting down");
                        break;
                    }
                }

                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT client is connected");
                        self.on_connect(&health_check_topic);
                    }
                    Ok(Event::Incoming(Packet::Publish(message))) => {
                        if let Some(name) = health_check_service(&message.topic) {
                            info!(service = %name, "Received request to update service data");
                            if self.health_checks.send(name).await.is_err() {
                                debug!("Health-check receiver dropped");
                            }
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!("MQTT client disconnected");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT client is disconnected");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
            }
        }
    }

    fn on_connect(&self, health_check_topic: &str) {
        info!(topic = %health_check_topic, "Subscribing to topics");
        if let Err(e) = self.client.try_subscribe(health_check_topic, QoS::AtLeastOnce) {
            warn!(error = %e, "Failed to subscribe");
        }

        let topic = self.service.health_topic();
        let payload = json!({"status": "up"}).to_string();
        match self.client.try_publish(&topic, QoS::AtLeastOnce, true, payload) {
            Ok(()) => info!(topic = %topic, "Published health message"),
            Err(e) => warn!(error = %e, "Failed to publish health message"),
        }
    }
}

/// Service named by a health-check command topic
/// (`<root>/<device>/<x>/service/<name>/cmd/health/check`).
pub fn health_check_service(topic: &str) -> Option<String> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() > 5 && topic.ends_with("/cmd/health/check") {
        return Some(parts[4].to_string());
    }
    None
}

fn mqtt_options(config: &ClientConfig, service: &Target) -> Result<MqttOptions, AgentError> {
    let client_id = format!("{}#{}", service.name(), service.topic());
    let mut options = MqttOptions::new(client_id, config.mqtt.host.clone(), config.mqtt_port());
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        service.health_topic(),
        json!({"status": "down"}).to_string(),
        QoS::AtLeastOnce,
        true,
    ));

    if config.use_certs() && config.mqtt_port() != 1883 {
        info!("Using client certificates to connect to thin-edge.io services");
        let ca = if config.ca_file.is_empty() {
            Vec::new()
        } else {
            std::fs::read(&config.ca_file)?
        };
        let cert = std::fs::read(&config.cert_file)?;
        let key = std::fs::read(&config.key)?;
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: Some((cert, key)),
        }));
    }
    Ok(options)
}

fn build_http_client(config: &ClientConfig) -> Result<reqwest::Client, AgentError> {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));

    if config.use_certs() {
        let mut pem = std::fs::read(&config.cert_file)?;
        pem.extend(std::fs::read(&config.key)?);
        builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        if !config.ca_file.is_empty() {
            let ca = std::fs::read(&config.ca_file)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&ca)?);
        }
    }

    Ok(builder.build()?)
}

/// Fail on error statuses other than `allowed`.
async fn check_status(
    response: reqwest::Response,
    allowed: &[StatusCode],
    what: &str,
) -> Result<reqwest::Response, AgentError> {
    let status = response.status();
    if status.is_success() || allowed.contains(&status) {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %body, "Failed to {}", what);
    Err(AgentError::Registry(format!("failed to {}: {} - {}", what, status, body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_service() {
        assert_eq!(
            health_check_service("te/device/main/service/app/cmd/health/check").as_deref(),
            Some("app")
        );
        assert_eq!(health_check_service("te/device/main/service/app/status/health"), None);
        assert_eq!(health_check_service("te/device/main"), None);
    }

    #[test]
    fn test_mqtt_options_without_certs() {
        let config = ClientConfig::default();
        let service = Target::new("te", "device/main//").service("tedge-container-plugin");
        let options = mqtt_options(&config, &service).unwrap();

        assert_eq!(
            options.client_id(),
            "tedge-container-plugin#te/device/main/service/tedge-container-plugin"
        );
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 1883));
        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "te/device/main/service/tedge-container-plugin/status/health");
        assert!(will.retain);
    }
}

//! State reconciliation: keeps the registry in line with the engine.
//!
//! A single [`ReconcileActor`] owns every pass. Engine events, health-check
//! commands and the metrics timer all go through its capacity-1 mailbox, so
//! two passes never overlap and callers are back-pressured while one runs.
//!
//! ```text
//!  engine events ──► Monitor ──(500ms)──┐
//!  health checks ──► route_health_checks ├──► ReconcilerHandle ──► ReconcileActor
//!  metrics timer ──► run_metrics_timer ──┘        (mailbox: 1)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actors::{self, Actor, ActorContext, ActorError, ActorHandle};
use crate::engine::{self, ContainerEngine, EngineEvent, FilterSpec, ServiceType};
use crate::error::AgentError;
use crate::metrics::publish_metrics;
use crate::registry::{Entity, Registry, Target};

/// Fragment name of the container twin data.
pub const TWIN_FRAGMENT: &str = "container";

/// Reconciliation settings.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Device the containers are registered under.
    pub device: Target,
    /// The agent's own service entity. Event messages go to its topic.
    pub service: Target,
    pub events_enabled: bool,
    pub delete_from_cloud: bool,
    pub delete_orphans: bool,
    /// Delay before a scheduled update, and between deregistering stale
    /// entities and deleting their cloud objects.
    pub settle_delay: Duration,
    /// Wait before resubscribing after the event stream ended.
    pub resubscribe_delay: Duration,
}

impl ReconcilerSettings {
    pub fn new(device: Target, service: Target) -> Self {
        Self {
            device,
            service,
            events_enabled: true,
            delete_from_cloud: true,
            delete_orphans: true,
            settle_delay: Duration::from_millis(500),
            resubscribe_delay: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// Reconciliation passes
// =============================================================================

/// Engine and registry plus the settings a pass needs.
#[derive(Clone)]
pub struct Reconciler {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn Registry>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<dyn Registry>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            engine,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// One reconciliation pass over the containers matching `filter`.
    ///
    /// Stale entities are only removed by unfiltered passes; a filtered pass
    /// cannot tell a missing container from one it did not look at.
    pub async fn do_update(&self, filter: &FilterSpec) -> Result<(), AgentError> {
        let device = &self.settings.device;

        let mut entities = self.registry.list_entities().await?;
        let mut pending: HashSet<String> = entities
            .iter()
            .filter(|(_, e)| ServiceType::from_type(&e.service_type).is_some())
            .map(|(topic_id, _)| topic_id.clone())
            .collect();

        let remove_stale = filter.is_empty();
        let items = engine::list(self.engine.as_ref(), filter).await?;
        debug!(count = items.len(), remove_stale, "Listed containers");

        for item in &items {
            let target = device.service(&item.name);
            pending.remove(&target.topic_id);

            let entity = Entity::service(&target, device, &item.name, item.service_type.as_str());
            if let Err(e) = self.registry.register(&entity).await {
                warn!(topic_id = %target.topic_id, error = %e, "Could not register container service");
            }
            entities.insert(target.topic_id.clone(), entity);
        }

        for item in &items {
            let target = device.service(&item.name);
            let payload = item.health_payload();
            if let Err(e) = self.registry.publish(&target.health_topic(), true, &payload).await {
                warn!(topic = %target.health_topic(), error = %e, "Failed to publish container health");
            }
        }

        for item in &items {
            let target = device.service(&item.name);
            if let Err(e) = self
                .registry
                .update_twin(&target, TWIN_FRAGMENT, &item.twin_fragment())
                .await
            {
                warn!(topic_id = %target.topic_id, error = %e, "Failed to update twin data");
            }
        }

        if remove_stale {
            self.remove_stale(pending, &mut entities).await;
        }

        if self.settings.delete_from_cloud && self.settings.delete_orphans {
            self.delete_orphans(&entities).await;
        }

        if let Err(e) = self.registry.sync_log_types().await {
            warn!(error = %e, "Could not sync log types");
        }
        Ok(())
    }

    async fn remove_stale(&self, pending: HashSet<String>, entities: &mut HashMap<String, Entity>) {
        let device = &self.settings.device;
        let mut stale: Vec<Target> = pending
            .into_iter()
            .map(|topic_id| Target::new(&device.root, &topic_id).with_cloud_identity(&device.cloud_identity))
            .collect();
        stale.sort_by(|a, b| a.topic_id.cmp(&b.topic_id));

        let mut removed = Vec::new();
        for target in stale {
            info!(topic_id = %target.topic_id, "Removing stale service");
            match self.registry.deregister(&target).await {
                Ok(()) => {
                    entities.remove(&target.topic_id);
                    removed.push(target);
                }
                Err(e) => warn!(topic_id = %target.topic_id, error = %e, "Failed to deregister service"),
            }
        }

        if removed.is_empty() {
            return;
        }

        // the cloud object may be recreated while the deregistration settles
        tokio::time::sleep(self.settings.settle_delay).await;

        if device.cloud_identity.is_empty() || !self.settings.delete_from_cloud {
            return;
        }
        for target in removed {
            match self.registry.delete_remote_object(&target).await {
                Ok(true) => info!(external_id = %target.external_id(), "Deleted cloud service"),
                Ok(false) => debug!(external_id = %target.external_id(), "No cloud service to delete"),
                Err(e) => warn!(external_id = %target.external_id(), error = %e, "Could not delete cloud service"),
            }
        }
    }

    async fn delete_orphans(&self, entities: &HashMap<String, Entity>) {
        let device = &self.settings.device;
        let services = match self.registry.list_cloud_services(device).await {
            Ok(services) => services,
            Err(e) => {
                warn!(error = %e, "Could not list cloud services");
                return;
            }
        };

        for service in services {
            let target = device.service(&service.name);
            if entities.contains_key(&target.topic_id) {
                continue;
            }
            info!(
                id = %service.id,
                name = %service.name,
                service_type = %service.service_type,
                "Removing orphaned cloud service"
            );
            if let Err(e) = self.registry.delete_cloud_object(&service.id).await {
                warn!(id = %service.id, error = %e, "Could not delete orphaned cloud service");
            }
        }
    }

    /// Publish stats for the containers matching `filter`.
    pub async fn update_metrics(&self, filter: &FilterSpec) -> Result<(), AgentError> {
        let items = engine::list(self.engine.as_ref(), filter).await?;
        publish_metrics(
            self.engine.clone(),
            self.registry.clone(),
            &self.settings.device,
            items,
        )
        .await
    }
}

// =============================================================================
// Actor
// =============================================================================

pub type Reply = oneshot::Sender<Result<(), AgentError>>;

/// Work for the reconciler. Each request is consumed exactly once.
#[derive(Debug)]
pub enum ActionRequest {
    UpdateAll {
        filter: FilterSpec,
        reply_to: Reply,
    },
    UpdateMetrics {
        filter: FilterSpec,
        reply_to: Reply,
    },
}

/// Runs reconciliation passes one at a time.
pub struct ReconcileActor {
    reconciler: Reconciler,
}

impl ReconcileActor {
    pub fn new(reconciler: Reconciler) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl Actor for ReconcileActor {
    type Message = ActionRequest;

    fn name(&self) -> &str {
        "reconciler"
    }

    async fn handle(&mut self, msg: ActionRequest, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        let (result, reply_to) = match msg {
            ActionRequest::UpdateAll { filter, reply_to } => {
                info!(filter = ?filter, "Processing update request");
                let result = self.reconciler.do_update(&filter).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Error updating container state");
                }
                (result, reply_to)
            }
            ActionRequest::UpdateMetrics { filter, reply_to } => {
                info!("Processing metrics request");
                let result = self.reconciler.update_metrics(&filter).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Error updating metrics");
                }
                (result, reply_to)
            }
        };

        let _ = reply_to.send(result);
        Ok(true)
    }
}

/// Cloneable front end of the reconciler actor.
#[derive(Clone)]
pub struct ReconcilerHandle {
    actor: ActorHandle<ActionRequest>,
}

impl ReconcilerHandle {
    /// Spawn the reconciler actor. It stops when `shutdown` turns true.
    pub fn spawn(reconciler: Reconciler, shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let (actor, task) = actors::spawn(ReconcileActor::new(reconciler), 1, shutdown);
        (Self { actor }, task)
    }

    /// Run a reconciliation pass and wait for its result.
    pub async fn update(&self, filter: FilterSpec) -> Result<(), AgentError> {
        self.actor
            .request(|reply_to| ActionRequest::UpdateAll { filter, reply_to })
            .await
            .map_err(actor_error)?
    }

    /// Publish metrics and wait for the result.
    pub async fn update_metrics(&self, filter: FilterSpec) -> Result<(), AgentError> {
        self.actor
            .request(|reply_to| ActionRequest::UpdateMetrics { filter, reply_to })
            .await
            .map_err(actor_error)?
    }

    /// Run a pass after `delay` without waiting for it.
    pub fn schedule_update(&self, filter: FilterSpec, delay: Duration) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = handle.update(filter).await {
                warn!(error = %e, "Scheduled update failed");
            }
        })
    }
}

fn actor_error(e: ActorError) -> AgentError {
    debug!(error = %e, "Reconciler is gone");
    AgentError::Cancelled
}

// =============================================================================
// Event monitor
// =============================================================================

/// Turns engine events into reconciliation passes and event messages.
pub struct Monitor {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn Registry>,
    settings: ReconcilerSettings,
    handle: ReconcilerHandle,
}

impl Monitor {
    pub fn new(reconciler: &Reconciler, handle: ReconcilerHandle) -> Self {
        Self {
            engine: reconciler.engine.clone(),
            registry: reconciler.registry.clone(),
            settings: reconciler.settings.clone(),
            handle,
        }
    }

    /// Watch engine events until the stream ends, fails or `cancel` fires.
    ///
    /// The initial update runs after subscribing so no change between the
    /// two is missed.
    pub async fn monitor(&self, mut cancel: watch::Receiver<bool>, filter: &FilterSpec) -> Result<(), AgentError> {
        if *cancel.borrow() {
            return Err(AgentError::Cancelled);
        }

        let mut events = self.engine.events().await?;

        if let Err(e) = self.handle.update(filter.clone()).await {
            warn!(error = %e, "Error updating container state");
        }

        loop {
            tokio::select! {
                biased;

                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!("Stopping engine monitor");
                        return Err(AgentError::Cancelled);
                    }
                }

                event = events.next() => match event {
                    Some(Ok(event)) => self.on_event(event, filter).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "Received error from engine event stream");
                        return Err(e);
                    }
                    None => {
                        info!("No more events");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Monitor with resubscription until cancelled.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>, filter: &FilterSpec) {
        loop {
            match self.monitor(cancel.clone(), filter).await {
                Err(AgentError::Cancelled) => return,
                Ok(()) => info!("Engine event stream ended"),
                Err(e) => error!(error = %e, "Engine monitor failed"),
            }

            tokio::select! {
                biased;

                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return;
                    }
                }

                _ = tokio::time::sleep(self.settings.resubscribe_delay) => {
                    info!("Resubscribing to engine events");
                }
            }
        }
    }

    async fn on_event(&self, event: EngineEvent, filter: &FilterSpec) {
        if event.action.starts_with("exec_") && !event.attribute("execID").is_empty() {
            debug!(action = %event.action, id = %event.id, "Ignoring exec event");
            return;
        }

        match update_scope(&event.action) {
            Some(UpdateScope::Container) => {
                info!(action = %event.action, id = %event.id, "Processing engine event");
                self.handle
                    .schedule_update(filter.narrowed_to(&event.id), self.settings.settle_delay);
            }
            Some(UpdateScope::All) => {
                info!(action = %event.action, id = %event.id, "Processing engine event");
                self.handle
                    .schedule_update(filter.clone(), self.settings.settle_delay);
            }
            None => {}
        }

        let Some(payload) = event_payload(&event) else {
            debug!(action = %event.action, "Event is not reported");
            return;
        };
        if self.settings.events_enabled {
            let topic = self.settings.service.topic_with(&["e", event.action.as_str()]);
            if let Err(e) = self.registry.publish(&topic, false, &payload).await {
                warn!(topic = %topic, error = %e, "Failed to publish event");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateScope {
    Container,
    All,
}

fn update_scope(action: &str) -> Option<UpdateScope> {
    match action {
        "create" | "start" | "stop" | "pause" | "unpause" | "exec_die" => Some(UpdateScope::Container),
        "destroy" | "remove" | "die" => Some(UpdateScope::All),
        "health_status: healthy" | "health_status: unhealthy" => Some(UpdateScope::Container),
        _ => None,
    }
}

fn action_text(action: &str) -> Option<&'static str> {
    Some(match action {
        "create" => "created",
        "start" => "started",
        "stop" => "stopped",
        "destroy" => "destroyed",
        "remove" => "removed",
        "die" => "died",
        "pause" => "paused",
        "unpause" => "unpaused",
        "exec_die" => "process died",
        "health_status: healthy" => "healthy",
        "health_status: unhealthy" => "unhealthy",
        _ => return None,
    })
}

/// Event message for `event`, or `None` for actions that are not reported.
fn event_payload(event: &EngineEvent) -> Option<serde_json::Value> {
    let text = action_text(&event.action)?;

    let name = event.attribute("name");
    let image = event.attribute("image");
    let project = event.attribute(engine::LABEL_COMPOSE_PROJECT);

    let text = if name.is_empty() || image.is_empty() {
        format!("container {}", text)
    } else if project.is_empty() {
        format!("container {}. name={}, image={}", text, name, image)
    } else {
        format!("container {}. project={}, name={}, image={}", text, project, name, image)
    };

    Some(json!({
        "text": text,
        "containerID": event.id,
        "attributes": event.attributes,
    }))
}

// =============================================================================
// Timers and commands
// =============================================================================

/// Send an `UpdateMetrics` request every `interval` until shutdown.
pub async fn run_metrics_timer(
    handle: ReconcilerHandle,
    filter: FilterSpec,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Stopping metrics timer");
                    return;
                }
            }

            _ = ticker.tick() => {
                info!("Refreshing metrics");
                if let Err(e) = handle.update_metrics(filter.clone()).await {
                    warn!(error = %e, "Error updating metrics");
                }
            }
        }
    }
}

/// Filter for a health-check command naming `requested`.
pub fn health_check_filter(requested: &str, own_service: &str) -> FilterSpec {
    if requested == own_service {
        FilterSpec::default()
    } else {
        FilterSpec::exact_name(requested)
    }
}

/// Turn health-check commands into update passes until the channel closes
/// or shutdown.
pub async fn route_health_checks(
    handle: ReconcilerHandle,
    mut requests: mpsc::Receiver<String>,
    own_service: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }

            request = requests.recv() => {
                let Some(name) = request else {
                    debug!("Health-check channel closed");
                    return;
                };
                info!(service = %name, "Updating service data on request");
                let filter = health_check_filter(&name, &own_service);
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.update(filter).await {
                        warn!(error = %e, "Error updating container state");
                    }
                });
            }
        }
    }
}

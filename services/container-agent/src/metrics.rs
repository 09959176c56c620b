//! Container resource usage published as `resource_usage` measurements.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::engine::{ContainerEngine, ContainerRecord};
use crate::error::AgentError;
use crate::registry::{Registry, Target};

/// Concurrent stats jobs.
pub const METRICS_WORKERS: usize = 5;

/// Publish one-shot stats for every container in `items`.
///
/// Containers whose service entity is not registered yet are skipped.
/// Every job runs to completion; failures are collected into
/// [`AgentError::PartialMetrics`].
pub async fn publish_metrics(
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn Registry>,
    device: &Target,
    items: Vec<ContainerRecord>,
) -> Result<(), AgentError> {
    if items.is_empty() {
        return Ok(());
    }

    let (jobs_tx, jobs_rx) = mpsc::channel(items.len());
    for item in items {
        // capacity equals the item count
        let _ = jobs_tx.try_send(item);
    }
    drop(jobs_tx);

    let jobs = Arc::new(Mutex::new(jobs_rx));
    let mut workers = JoinSet::new();
    for _ in 0..METRICS_WORKERS {
        let jobs = jobs.clone();
        let engine = engine.clone();
        let registry = registry.clone();
        let device = device.clone();
        workers.spawn(async move {
            let mut errors = Vec::new();
            loop {
                let next = jobs.lock().await.recv().await;
                let Some(item) = next else {
                    break;
                };
                if let Err(e) = publish_one(engine.as_ref(), registry.as_ref(), &device, &item).await {
                    warn!(container = %item.name, error = %e, "Failed to update metrics");
                    errors.push(format!("{}: {}", item.name, e));
                }
            }
            errors
        });
    }

    let mut errors = Vec::new();
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(worker_errors) => errors.extend(worker_errors),
            Err(e) => errors.push(format!("metrics worker failed: {}", e)),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AgentError::PartialMetrics(errors))
    }
}

async fn publish_one(
    engine: &dyn ContainerEngine,
    registry: &dyn Registry,
    device: &Target,
    item: &ContainerRecord,
) -> Result<(), AgentError> {
    let target = device.service(&item.name);
    match registry.has_entity(&target).await {
        Ok(true) => {}
        _ => {
            info!(topic_id = %target.topic_id, "Entity has not been registered yet, skipping metric for it");
            return Ok(());
        }
    }

    let stats = engine.stats(&item.id).await?;
    let topic = target.topic_with(&["m", "resource_usage"]);
    let payload = stats.telemetry();
    info!(topic = %topic, payload = %payload, "Publish container stats");
    registry.publish(&topic, false, &payload).await
}

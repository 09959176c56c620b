//! Container lifecycle orchestration.
//!
//! Replaces a running container with a clone built from a (possibly new)
//! image. A container cannot replace itself, so a self-update forks a
//! short-lived helper container that runs the clone on its behalf.
//!
//! ## State Machine
//!
//! ```text
//! idle -> resolve_target -> pull_image -> decide (check only)
//!                               |
//!                               +-> fork (self-update)
//!                               +-> [wait_for_exit] -> clone -> health_wait -> done
//!
//! any phase -> failed
//! ```
//!
//! There is no automatic rollback. A failed clone leaves the renamed
//! original and the clone in place for the operator.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::engine::{self, ContainerEngine, ContainerInspectResponse, FilterSpec, Status, LABEL_FORK};
use crate::error::AgentError;

pub mod clone;
pub mod compose;
pub mod packages;
pub mod pull;

pub use clone::{clone_config, container_name, fork_config};
pub use pull::{pull_image, CredentialSource, NoCredentials, PullPolicy, RegistryCredentials};

/// Files whose presence means the process runs inside a container.
pub const CONTAINER_MARKERS: [&str; 2] = ["/.dockerenv", "/run/.containerenv"];

/// Binary the fork helper runs.
pub const PROGRAM_NAME: &str = "tedge-container";

/// Log lines captured from a clone that did not become healthy.
const FAILED_CLONE_LOG_LINES: usize = 100;

// =============================================================================
// Requests and outcomes
// =============================================================================

/// Phase of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    ResolveTarget,
    PullImage,
    /// Check-only: compare image ids.
    Decide,
    /// Hand the update to a helper container.
    Fork,
    WaitForExit,
    Clone,
    HealthWait,
    Done,
    Failed,
}

impl UpdatePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::ResolveTarget => "resolve_target",
            UpdatePhase::PullImage => "pull_image",
            UpdatePhase::Decide => "decide",
            UpdatePhase::Fork => "fork",
            UpdatePhase::WaitForExit => "wait_for_exit",
            UpdatePhase::Clone => "clone",
            UpdatePhase::HealthWait => "health_wait",
            UpdatePhase::Done => "done",
            UpdatePhase::Failed => "failed",
        }
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to build the replacement container.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneSpec {
    /// Target image; defaults to the container's current image.
    pub image: Option<String>,
    /// Environment entries appended to the original ones.
    pub env: Vec<String>,
    /// Extra hosts appended to the original ones.
    pub extra_hosts: Vec<String>,
    /// Replaces the original command when non-empty.
    pub cmd: Vec<String>,
    /// Replaces the original entrypoint when non-empty.
    pub entrypoint: Vec<String>,
    /// Labels added to the clone.
    pub labels: HashMap<String, String>,
    /// Labels added to the fork helper.
    pub fork_labels: HashMap<String, String>,
    pub auto_remove: bool,
    /// How long the clone has to become healthy.
    pub healthy_after: Duration,
    /// How long to wait for the original to exit on its own.
    pub stop_timeout: Duration,
    /// Delay before the original is stopped.
    pub stop_after: Duration,
    /// Drop port bindings so the clone cannot conflict with the original.
    pub ignore_port_conflicts: bool,
    /// Wait for the original to exit instead of stopping it.
    pub wait_for_exit: bool,
    /// Run the clone without networking.
    pub skip_network: bool,
}

impl Default for CloneSpec {
    fn default() -> Self {
        Self {
            image: None,
            env: Vec::new(),
            extra_hosts: Vec::new(),
            cmd: Vec::new(),
            entrypoint: Vec::new(),
            labels: HashMap::new(),
            fork_labels: HashMap::new(),
            auto_remove: false,
            healthy_after: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(60),
            stop_after: Duration::ZERO,
            ignore_port_conflicts: false,
            wait_for_exit: false,
            skip_network: false,
        }
    }
}

/// An update request.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Container id or name; the current container when unset.
    pub container: Option<String>,
    pub spec: CloneSpec,
    /// Skip the image comparison.
    pub force: bool,
    /// Always hand the update to a helper container.
    pub fork: bool,
    /// Only report whether an update is needed.
    pub check_only: bool,
}

/// Result of an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The clone is healthy and the original was removed.
    Updated { container_id: String },
    /// Check-only: the container already runs the target image.
    NotNeeded,
    /// Check-only: the container should be updated.
    UpdateNeeded,
    /// A helper container took over the update.
    Forked { helper_id: String },
}

/// Poll and settle intervals.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Interval between container state polls.
    pub poll_interval: Duration,
    /// How long the fork helper has to become healthy.
    pub fork_healthy_after: Duration,
    /// Consecutive running polls that count as healthy for containers
    /// without a healthcheck.
    pub running_polls: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            fork_healthy_after: Duration::from_secs(30),
            running_polls: 3,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Drives container updates against a [`ContainerEngine`].
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    credentials: Arc<dyn CredentialSource>,
    pull_policy: PullPolicy,
    timings: Timings,
    hostname: Option<String>,
    container_markers: Vec<PathBuf>,
    phase: UpdatePhase,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            credentials: Arc::new(NoCredentials),
            pull_policy: PullPolicy::default(),
            timings: Timings::default(),
            hostname: local_hostname(),
            container_markers: CONTAINER_MARKERS.iter().map(PathBuf::from).collect(),
            phase: UpdatePhase::Idle,
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

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Hostname used to find the current container.
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    /// Files checked to decide whether we run inside a container.
    pub fn with_container_markers(mut self, markers: Vec<PathBuf>) -> Self {
        self.container_markers = markers;
        self
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    fn transition(&mut self, phase: UpdatePhase) {
        info!(from = %self.phase, to = %phase, "Update phase transition");
        self.phase = phase;
    }

    fn inside_container(&self) -> bool {
        self.container_markers.iter().any(|p| p.exists())
    }

    /// Run an update to completion.
    pub async fn update(&mut self, request: &UpdateRequest) -> Result<UpdateOutcome, AgentError> {
        self.phase = UpdatePhase::Idle;
        match self.run(request).await {
            Ok(outcome) => {
                self.transition(UpdatePhase::Done);
                Ok(outcome)
            }
            Err(e) => {
                error!(phase = %self.phase, error = %e, "Update failed");
                self.transition(UpdatePhase::Failed);
                Err(e)
            }
        }
    }

    async fn run(&mut self, request: &UpdateRequest) -> Result<UpdateOutcome, AgentError> {
        self.transition(UpdatePhase::ResolveTarget);
        let (current, is_self) = self.resolve_target(request.container.as_deref()).await?;
        let current_id = current.id.clone().unwrap_or_default();
        let image = match &request.spec.image {
            Some(image) => image.clone(),
            None => {
                let image = current
                    .config
                    .as_ref()
                    .and_then(|c| c.image.clone())
                    .unwrap_or_default();
                info!(image = %image, "Using image of current container");
                image
            }
        };
        let spec = CloneSpec {
            image: Some(image.clone()),
            ..request.spec.clone()
        };

        self.transition(UpdatePhase::PullImage);
        pull_image(
            self.engine.as_ref(),
            &image,
            &self.pull_policy,
            self.credentials.as_ref(),
        )
        .await?;

        if request.check_only {
            self.transition(UpdatePhase::Decide);
            if request.force {
                info!("Forcing an update");
                return Ok(UpdateOutcome::UpdateNeeded);
            }
            return if update_required(self.engine.as_ref(), &current, &image).await? {
                info!(container = %current_id, image = %image, "Image needs updating");
                Ok(UpdateOutcome::UpdateNeeded)
            } else {
                info!(container = %current_id, image = %image, "Image does not need updating");
                Ok(UpdateOutcome::NotNeeded)
            };
        }

        if request.fork || is_self {
            self.transition(UpdatePhase::Fork);
            let helper_id = self.fork(&current, &spec).await?;
            return Ok(UpdateOutcome::Forked { helper_id });
        }

        if spec.wait_for_exit {
            self.transition(UpdatePhase::WaitForExit);
            match self.engine.disable_restart(&current_id).await {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
            self.wait_for_stop(&current_id, spec.stop_timeout).await?;
        }

        self.transition(UpdatePhase::Clone);
        let clone_id = self.clone_container(&current, &spec).await?;

        self.transition(UpdatePhase::HealthWait);
        if let Err(e) = self.wait_for_healthy(&clone_id, spec.healthy_after).await {
            match self.engine.logs(&clone_id, FAILED_CLONE_LOG_LINES).await {
                Ok(logs) => error!(container = %clone_id, logs = %logs, "Clone did not become healthy"),
                Err(log_err) => warn!(container = %clone_id, error = %log_err, "Could not read clone logs"),
            }
            return Err(e);
        }

        info!(container = %current_id, "Removing previous container");
        engine::stop_remove(self.engine.as_ref(), &current_id).await?;
        Ok(UpdateOutcome::Updated {
            container_id: clone_id,
        })
    }

    /// The container to update and whether it is the one we run in.
    async fn resolve_target(
        &self,
        container: Option<&str>,
    ) -> Result<(ContainerInspectResponse, bool), AgentError> {
        let hostname = self.hostname.clone().unwrap_or_default();

        let Some(container) = container else {
            info!("No container provided, inferring the update is intended for the current container");
            let current = resolve_self(self.engine.as_ref(), &hostname).await?;
            info!(
                id = current.id.as_deref().unwrap_or_default(),
                name = container_name(&current),
                "Found current container"
            );
            return Ok((current, true));
        };

        let target = self.engine.inspect(container).await?;
        if !self.inside_container() || hostname.is_empty() {
            return Ok((target, false));
        }
        let is_self = match resolve_self(self.engine.as_ref(), &hostname).await {
            Ok(current) => current.id == target.id,
            Err(_) => false,
        };
        Ok((target, is_self))
    }

    /// Start a helper container that clones `current`, returning its id.
    ///
    /// The helper is awaited until healthy; `current` is never stopped
    /// from here.
    async fn fork(&self, current: &ContainerInspectResponse, spec: &CloneSpec) -> Result<String, AgentError> {
        if !self.inside_container() {
            return Err(AgentError::ForkOutsideContainer);
        }

        let current_id = current.id.clone().unwrap_or_default();
        let entrypoint = fork_entrypoint(
            find_executable("sudo").is_some(),
            &current_id,
            spec.image.as_deref().unwrap_or_default(),
            spec,
        );
        info!(command = %entrypoint.join(" "), "Forking container");

        let helper_name = format!("{}-updater", container_name(current));
        engine::stop_remove(self.engine.as_ref(), &helper_name).await?;

        let config = fork_config(current, spec, entrypoint);
        let helper_id = self.engine.create(&helper_name, config).await?;
        self.engine.start(&helper_id).await?;
        info!(id = %helper_id, "Successfully created forked container");

        self.wait_for_healthy(&helper_id, self.timings.fork_healthy_after)
            .await?;
        Ok(helper_id)
    }

    /// Rename the original out of the way and start its replacement.
    async fn clone_container(
        &self,
        current: &ContainerInspectResponse,
        spec: &CloneSpec,
    ) -> Result<String, AgentError> {
        let current_id = current.id.clone().unwrap_or_default();
        let name = container_name(current).to_string();
        let backup_name = format!("{}-bak-{}", name, chrono::Utc::now().timestamp());

        // stale backup from an earlier attempt in the same second
        engine::stop_remove(self.engine.as_ref(), &backup_name).await?;

        if !spec.wait_for_exit {
            if !spec.stop_after.is_zero() {
                info!(delay = ?spec.stop_after, "Waiting before stopping the container");
                tokio::time::sleep(spec.stop_after).await;
            }
            info!(container = %current_id, "Stopping container");
            self.engine.stop(&current_id, None).await?;
        }

        info!(container = %current_id, backup = %backup_name, "Renaming container");
        self.engine.rename(&current_id, &backup_name).await?;

        let config = clone_config(current, spec);
        let clone_id = self.engine.create(&name, config).await?;
        info!(container = %clone_id, name = %name, "Created clone");

        if let Err(e) = self.engine.start(&clone_id).await {
            warn!(container = %clone_id, error = %e, "Failed to start clone");
        }
        Ok(clone_id)
    }

    /// Wait until the container is no longer running.
    async fn wait_for_stop(&self, id: &str, limit: Duration) -> Result<(), AgentError> {
        info!(container = %id, timeout = ?limit, "Waiting for container to exit");
        let poll = async {
            loop {
                match self.engine.inspect(id).await {
                    Ok(c) if !is_running(&c) => return Ok(()),
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(self.timings.poll_interval).await;
            }
        };
        tokio::time::timeout(limit, poll)
            .await
            .map_err(|_| AgentError::Timeout {
                what: format!("container {} to exit", id),
                elapsed: limit,
            })?
    }

    /// Wait until the container reports healthy, or for containers
    /// without a healthcheck, until it stays running.
    ///
    /// Inspect errors are retried until the deadline.
    async fn wait_for_healthy(&self, id: &str, limit: Duration) -> Result<(), AgentError> {
        info!(container = %id, timeout = ?limit, "Waiting for container to be healthy");
        let poll = async {
            let mut running_polls = 0;
            loop {
                let container = match self.engine.inspect(id).await {
                    Ok(container) => container,
                    Err(e) => {
                        warn!(container = %id, error = %e, "Could not inspect container");
                        tokio::time::sleep(self.timings.poll_interval).await;
                        continue;
                    }
                };
                match health_status(&container) {
                    Some(status) if status == "healthy" => return Ok(()),
                    Some(status) if status == "unhealthy" => return Err(AgentError::Unhealthy(id.to_string())),
                    Some(status) => info!(container = %id, status = %status, "Container is not healthy yet"),
                    None if is_running(&container) => {
                        running_polls += 1;
                        if running_polls >= self.timings.running_polls {
                            return Ok(());
                        }
                    }
                    None => running_polls = 0,
                }
                tokio::time::sleep(self.timings.poll_interval).await;
            }
        };
        tokio::time::timeout(limit, poll)
            .await
            .map_err(|_| AgentError::Timeout {
                what: format!("container {} to be healthy", id),
                elapsed: limit,
            })?
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Find the container this process runs in.
///
/// Tries the hostname as a container id first, then scans running
/// containers for a matching container-id file, hostname or `HOSTNAME`
/// environment entry. Fork helpers are never matched by the scan.
pub async fn resolve_self(
    engine: &dyn ContainerEngine,
    hostname: &str,
) -> Result<ContainerInspectResponse, AgentError> {
    if hostname.is_empty() {
        return Err(AgentError::NotFound("current container (no hostname)".into()));
    }
    if let Ok(container) = engine.inspect(hostname).await {
        return Ok(container);
    }

    let env_entry = format!("HOSTNAME={}", hostname);
    for record in engine.list_containers(&FilterSpec::default()).await? {
        if record.status != Status::Up {
            continue;
        }
        let container = match engine.inspect(&record.id).await {
            Ok(c) => c,
            Err(_) => continue,
        };

        let id_file = container
            .host_config
            .as_ref()
            .and_then(|h| h.container_id_file.as_deref())
            .unwrap_or_default();
        if !id_file.is_empty() {
            if let Ok(contents) = std::fs::read_to_string(id_file) {
                if contents.contains(hostname) {
                    return Ok(container);
                }
            }
        }

        let Some(config) = container.config.as_ref() else {
            continue;
        };
        if config.labels.as_ref().is_some_and(|l| l.contains_key(LABEL_FORK)) {
            continue;
        }
        let hostname_match = config.hostname.as_deref() == Some(hostname);
        let env_match = config.env.iter().flatten().any(|e| *e == env_entry);
        if hostname_match || env_match {
            return Ok(container);
        }
    }
    Err(AgentError::NotFound(format!("current container (hostname {})", hostname)))
}

/// Whether this process runs inside a container.
pub fn is_inside_container() -> bool {
    CONTAINER_MARKERS.iter().any(|p| Path::new(p).exists())
}

/// Whether `container` runs a different image than the local `image`.
/// A missing local image counts as different.
pub async fn update_required(
    engine: &dyn ContainerEngine,
    container: &ContainerInspectResponse,
    image: &str,
) -> Result<bool, AgentError> {
    let Some(image_id) = engine.image_id(image).await? else {
        return Ok(true);
    };
    Ok(container.image.as_deref() != Some(image_id.as_str()))
}

/// Command line of the fork helper.
pub fn fork_entrypoint(use_sudo: bool, container_id: &str, image: &str, spec: &CloneSpec) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    if use_sudo {
        args.push("sudo".into());
    }
    args.extend(
        [PROGRAM_NAME, "tools", "container-clone", "--container", container_id, "--image", image]
            .map(String::from),
    );
    let durations = [
        ("--duration", spec.healthy_after),
        ("--stop-timeout", spec.stop_timeout),
        ("--stop-after", spec.stop_after),
    ];
    for (flag, value) in durations {
        args.push(flag.into());
        args.push(humantime::format_duration(value).to_string());
    }
    if spec.wait_for_exit {
        args.push("--wait-for-exit".into());
    }
    if spec.ignore_port_conflicts {
        args.push("--ignore-ports".into());
    }
    if spec.auto_remove {
        args.push("--rm".into());
    }
    for host in &spec.extra_hosts {
        args.push("--add-host".into());
        args.push(host.clone());
    }
    for env in &spec.env {
        args.push("--env".into());
        args.push(env.clone());
    }
    args
}

/// Path of an executable, searching `PATH` for bare names.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

/// Hostname of this machine or container.
pub fn local_hostname() -> Option<String> {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
}

fn is_running(container: &ContainerInspectResponse) -> bool {
    container
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false)
}

/// Healthcheck status, `None` when the container has no healthcheck.
fn health_status(container: &ContainerInspectResponse) -> Option<String> {
    let has_healthcheck = container
        .config
        .as_ref()
        .and_then(|c| c.healthcheck.as_ref())
        .is_some();
    if !has_healthcheck {
        return None;
    }
    let status = container
        .state
        .as_ref()
        .and_then(|s| s.health.as_ref())
        .and_then(|h| h.status.as_ref())
        .map(|s| s.to_string())
        .unwrap_or_default();
    Some(status)
}

//! Agent error taxonomy and process exit codes.

use std::time::Duration;

use tedge_container_cmdbuilder::CmdError;
use thiserror::Error;

/// Exit code for "no action needed / not applicable".
pub const EXIT_NOT_APPLICABLE: i32 = 2;

/// Exit code for any other failure.
pub const EXIT_FAILURE: i32 = 1;

/// Errors raised by the engine, registry, orchestrator and reconciler.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Container, image or entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// No compose backend answered its version probe.
    #[error("compose backend not detected: {0}")]
    BackendNotDetected(#[source] CmdError),

    /// Compose command resolution or execution failed.
    #[error(transparent)]
    Command(CmdError),

    /// Image pull retries exhausted.
    #[error("failed to pull image '{image}' after {attempts} attempt(s): {reason}")]
    PullFailed {
        image: String,
        attempts: u32,
        reason: String,
    },

    /// A bounded wait elapsed.
    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// The container's healthcheck reported unhealthy.
    #[error("container {0} is unhealthy")]
    Unhealthy(String),

    /// Self-update was requested outside of a container.
    #[error("cannot fork a helper container: process is not running inside a container")]
    ForkOutsideContainer,

    /// A reconciliation pass failed.
    #[error("reconciliation failed: {0}")]
    Reconcile(String),

    /// Some metrics jobs failed; the others completed.
    #[error("{} metrics job(s) failed: {}", .0.len(), .0.join("; "))]
    PartialMetrics(Vec<String>),

    /// The operation is not supported.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Nothing to do. Reported silently with its own exit code.
    #[error("no action needed: {0}")]
    NotApplicable(String),

    /// Container engine API error.
    #[error("container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    /// Registry (HTTP or MQTT) error.
    #[error("registry error: {0}")]
    Registry(String),

    /// Invalid configuration or arguments.
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Ends a command with a specific exit code.
    #[error("{reason}")]
    Exit { code: i32, reason: String, silent: bool },

    /// Filesystem or process error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CmdError> for AgentError {
    fn from(err: CmdError) -> Self {
        match err {
            CmdError::NoBackendFound { .. } => AgentError::BackendNotDetected(err),
            other => AgentError::Command(other),
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Registry(err.to_string())
    }
}

impl From<rumqttc::ClientError> for AgentError {
    fn from(err: rumqttc::ClientError) -> Self {
        AgentError::Registry(err.to_string())
    }
}

impl AgentError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AgentError::NotFound(_))
    }
}

/// Whether the error is a silent "nothing to do" outcome.
pub fn is_silent(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<AgentError>(),
        Some(AgentError::NotApplicable(_)) | Some(AgentError::Exit { silent: true, .. })
    )
}

/// Process exit code for an error returned by a CLI command.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<AgentError>() {
        Some(AgentError::NotApplicable(_)) => EXIT_NOT_APPLICABLE,
        Some(AgentError::Exit { code, .. }) => *code,
        _ => EXIT_FAILURE,
    }
}

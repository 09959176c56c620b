//! Compose command resolution.
//!
//! Container groups are driven through whichever compose front-end is
//! installed on the host. The front-ends disagree on flags, so this library:
//!
//! - **Detects** the backend by probing a fixed, ordered candidate list
//! - **Parses** the backend version out of its free-text `version` banner
//! - **Builds** invocations by applying version-gated flag rules
//! - **Checks** the `exit code: N` marker that some backends print instead of
//!   returning a failing process status
//!
//! # Invariants
//!
//! - A resolved command always carries a fully parsed semantic version
//! - Building a command is a pure function of its inputs

mod command;
mod detect;
mod marker;

use thiserror::Error;

pub use command::{build_command, default_compose_rules, BaseCommand, FlagAction, FlagRule, RuntimeCommand};
pub use detect::{
    compose_candidates, detect, detect_with, parse_version, Candidate, ProcessProber,
    VersionProber, DOCKER_COMPOSE, DOCKER_COMPOSE_STANDALONE, PODMAN_COMPOSE,
};
pub use marker::{check_exit_code_marker, last_exit_code};

/// Command resolution errors.
#[derive(Debug, Error)]
pub enum CmdError {
    /// None of the candidate backends answered their version probe.
    #[error("compose cli not found (tried: {})", tried.join(", "))]
    NoBackendFound { tried: Vec<String> },

    /// A single probe failed to run or exited unsuccessfully.
    #[error("probe of '{command}' failed: {output}")]
    ProbeFailed { command: String, output: String },

    /// The backend answered but its version could not be parsed.
    #[error("could not parse version of '{command}' from '{raw}'")]
    VersionParse { command: String, raw: String },

    /// A flag rule carried an invalid version constraint.
    #[error("invalid version constraint '{constraint}': {source}")]
    InvalidConstraint {
        constraint: String,
        #[source]
        source: semver::Error,
    },

    /// The command output reported a non-zero exit code marker.
    #[error("command failed. exit_code={0}")]
    ExitCode(i64),
}

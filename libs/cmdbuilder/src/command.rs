//! Base commands and version-gated flag rules.

use std::fmt;

use semver::{Version, VersionReq};

use crate::detect::PODMAN_COMPOSE;
use crate::CmdError;

/// A program plus the fixed arguments that select the compose front-end,
/// e.g. `docker` + `["compose"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseCommand {
    program: String,
    args: Vec<String>,
}

impl BaseCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Executable to spawn.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Fixed leading arguments.
    pub fn base_args(&self) -> &[String] {
        &self.args
    }

    /// Whether this command is `name`, compared on the space-joined form.
    pub fn is(&self, name: &str) -> bool {
        self.to_string() == name
    }

    /// Leading arguments followed by `extra`.
    pub fn args_with(&self, extra: &[String]) -> Vec<String> {
        let mut out = self.args.clone();
        out.extend_from_slice(extra);
        out
    }
}

impl fmt::Display for BaseCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A detected backend and its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCommand {
    pub base: BaseCommand,
    pub version: Version,
}

impl RuntimeCommand {
    pub fn new(base: BaseCommand, version: Version) -> Self {
        Self { base, version }
    }

    /// Resolve `args` into a `(program, argv)` pair ready to spawn.
    ///
    /// The subcommand is `args[0]`. Rules are applied exactly once.
    pub fn invocation(&self, args: &[String], rules: &[FlagRule]) -> (String, Vec<String>) {
        let argv = build_command(self, args, rules);
        (self.base.program().to_string(), self.base.args_with(&argv))
    }

    /// podman-compose swallows failing exit codes, so its output must be
    /// checked for the exit code marker.
    pub fn reports_exit_code_in_output(&self) -> bool {
        self.base.is(PODMAN_COMPOSE)
    }
}

/// What a rule does to the argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagAction {
    Append,
    Prepend,
    Remove,
}

/// A flag edit guarded by backend, subcommand and an optional version
/// constraint.
#[derive(Debug, Clone)]
pub struct FlagRule {
    pub action: FlagAction,
    pub command: String,
    pub subcommand: String,
    pub flag: String,
    pub constraint: Option<VersionReq>,
}

impl FlagRule {
    fn new(action: FlagAction, command: &str, subcommand: &str, flag: &str) -> Self {
        Self {
            action,
            command: command.to_string(),
            subcommand: subcommand.to_string(),
            flag: flag.to_string(),
            constraint: None,
        }
    }

    pub fn append(command: &str, subcommand: &str, flag: &str) -> Self {
        Self::new(FlagAction::Append, command, subcommand, flag)
    }

    pub fn prepend(command: &str, subcommand: &str, flag: &str) -> Self {
        Self::new(FlagAction::Prepend, command, subcommand, flag)
    }

    /// Removes every occurrence of `flag`.
    pub fn remove(command: &str, subcommand: &str, flag: &str) -> Self {
        Self::new(FlagAction::Remove, command, subcommand, flag)
    }

    /// Only fire when the backend version satisfies `constraint`
    /// (semver syntax, e.g. `>=1.0, <2.0`).
    pub fn when(mut self, constraint: &str) -> Result<Self, CmdError> {
        let req = VersionReq::parse(constraint).map_err(|source| CmdError::InvalidConstraint {
            constraint: constraint.to_string(),
            source,
        })?;
        self.constraint = Some(req);
        Ok(self)
    }

    fn fires(&self, command: &RuntimeCommand, subcommand: &str) -> bool {
        command.base.is(&self.command)
            && self.subcommand == subcommand
            && self
                .constraint
                .as_ref()
                .map_or(true, |req| req.matches(&command.version))
    }
}

/// Apply `rules` in order to `args`, using `args[0]` as the subcommand.
///
/// Applying the rules to their own output is not idempotent, so callers
/// build from the original arguments once per invocation.
pub fn build_command(command: &RuntimeCommand, args: &[String], rules: &[FlagRule]) -> Vec<String> {
    let subcommand = args.first().map(String::as_str).unwrap_or_default();
    let mut out = args.to_vec();

    for rule in rules.iter().filter(|r| r.fires(command, subcommand)) {
        match rule.action {
            FlagAction::Append => out.push(rule.flag.clone()),
            FlagAction::Prepend => out.insert(0, rule.flag.clone()),
            FlagAction::Remove => out.retain(|arg| arg != &rule.flag),
        }
    }

    out
}

/// Rules that normalise the differences between compose front-ends.
pub fn default_compose_rules() -> Result<Vec<FlagRule>, CmdError> {
    Ok(vec![
        // podman-compose down rejects --remove-orphans
        FlagRule::remove(PODMAN_COMPOSE, "down", "--remove-orphans"),
        // newer podman-compose only prints the exit code marker in verbose mode
        FlagRule::prepend(PODMAN_COMPOSE, "up", "--verbose").when(">=1.1.0")?,
    ])
}

//! Backend detection.

use async_trait::async_trait;
use semver::Version;
use tracing::{debug, info, warn};

use crate::command::{BaseCommand, RuntimeCommand};
use crate::CmdError;

pub const DOCKER_COMPOSE: &str = "docker compose";
pub const DOCKER_COMPOSE_STANDALONE: &str = "docker-compose";
pub const PODMAN_COMPOSE: &str = "podman-compose";

/// A backend to probe and the banner prefixes its version line may carry.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub command: BaseCommand,
    pub version_prefixes: Vec<String>,
}

impl Candidate {
    pub fn new(command: BaseCommand, version_prefixes: &[&str]) -> Self {
        Self {
            command,
            version_prefixes: version_prefixes.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Version token from the first line starting with one of the prefixes,
    /// cut at the first comma.
    ///
    /// Prefixes are tried in order, so a later prefix is only used when no
    /// line matches an earlier one.
    pub fn version_token<'a>(&self, output: &'a str) -> Option<&'a str> {
        self.version_prefixes.iter().find_map(|prefix| {
            output.lines().find_map(|line| {
                line.strip_prefix(prefix.as_str())
                    .map(|rest| rest.split(',').next().unwrap_or(rest).trim())
            })
        })
    }
}

/// The built-in candidates, in priority order.
pub fn compose_candidates() -> Vec<Candidate> {
    let docker_banners = ["Docker Compose version ", "docker-compose version "];
    vec![
        Candidate::new(BaseCommand::new("docker", ["compose"]), &docker_banners),
        Candidate::new(
            BaseCommand::new(DOCKER_COMPOSE_STANDALONE, Vec::<String>::new()),
            &docker_banners,
        ),
        Candidate::new(
            BaseCommand::new(PODMAN_COMPOSE, Vec::<String>::new()),
            &["podman-compose version "],
        ),
    ]
}

/// Runs a candidate's `version` subcommand.
#[async_trait]
pub trait VersionProber: Send + Sync {
    /// Combined stdout and stderr of `<command> version`.
    ///
    /// Fails when the program is missing or exits unsuccessfully.
    async fn probe(&self, command: &BaseCommand) -> Result<String, CmdError>;
}

/// Probes by spawning the real process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessProber;

#[async_trait]
impl VersionProber for ProcessProber {
    async fn probe(&self, command: &BaseCommand) -> Result<String, CmdError> {
        let output = tokio::process::Command::new(command.program())
            .args(command.base_args())
            .arg("version")
            .output()
            .await
            .map_err(|e| CmdError::ProbeFailed {
                command: command.to_string(),
                output: e.to_string(),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(CmdError::ProbeFailed {
                command: command.to_string(),
                output: text,
            });
        }
        Ok(text)
    }
}

/// Detect the installed compose backend using the built-in candidates.
pub async fn detect(prober: &dyn VersionProber) -> Result<RuntimeCommand, CmdError> {
    detect_with(&compose_candidates(), prober).await
}

/// Detect using an explicit candidate list.
///
/// The first candidate whose probe succeeds wins. If its version cannot be
/// parsed, detection fails rather than falling through.
pub async fn detect_with(
    candidates: &[Candidate],
    prober: &dyn VersionProber,
) -> Result<RuntimeCommand, CmdError> {
    let mut tried = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        tried.push(candidate.command.to_string());

        let output = match prober.probe(&candidate.command).await {
            Ok(output) => output,
            Err(e) => {
                debug!(command = %candidate.command, error = %e, "Compose backend probe failed");
                continue;
            }
        };

        let raw = candidate.version_token(&output).unwrap_or_default();
        let version = parse_version(raw).map_err(|_| {
            warn!(command = %candidate.command, output = %output, "Could not parse compose version");
            CmdError::VersionParse {
                command: candidate.command.to_string(),
                raw: raw.to_string(),
            }
        })?;

        info!(command = %candidate.command, version = %version, "Detected compose backend");
        return Ok(RuntimeCommand::new(candidate.command.clone(), version));
    }

    Err(CmdError::NoBackendFound { tried })
}

/// Parse a version token such as `v2.10.0`, `1.29.2` or `2.10`.
pub fn parse_version(raw: &str) -> Result<Version, CmdError> {
    let err = || CmdError::VersionParse {
        command: String::new(),
        raw: raw.to_string(),
    };

    let token = raw.split_whitespace().next().ok_or_else(err)?;
    let token = token.strip_prefix('v').unwrap_or(token);

    if let Ok(version) = Version::parse(token) {
        return Ok(version);
    }

    let parts: Vec<&str> = token.split('.').collect();
    let numeric = parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if parts.len() < 3 && numeric {
        let mut padded = parts.join(".");
        for _ in parts.len()..3 {
            padded.push_str(".0");
        }
        return Version::parse(&padded).map_err(|_| err());
    }

    Err(err())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Prober returning canned results per command.
    struct ScriptedProber {
        answers: HashMap<String, Result<String, String>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        fn new(answers: &[(&str, Result<&str, &str>)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(cmd, res)| {
                        (
                            cmd.to_string(),
                            (*res).map(str::to_string).map_err(str::to_string),
                        )
                    })
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VersionProber for ScriptedProber {
        async fn probe(&self, command: &BaseCommand) -> Result<String, CmdError> {
            let key = command.to_string();
            self.calls.lock().unwrap().push(key.clone());
            match self.answers.get(&key) {
                Some(Ok(out)) => Ok(out.clone()),
                Some(Err(out)) => Err(CmdError::ProbeFailed {
                    command: key,
                    output: out.clone(),
                }),
                None => Err(CmdError::ProbeFailed {
                    command: key,
                    output: "not found".to_string(),
                }),
            }
        }
    }

    fn tool(name: &str) -> Candidate {
        Candidate::new(BaseCommand::new(name, Vec::<String>::new()), &["Tool version "])
    }

    #[tokio::test]
    async fn test_first_successful_probe_wins() {
        let prober = ScriptedProber::new(&[
            ("a", Err("exit status 127")),
            ("b", Ok("Tool version 2.10.0\n")),
            ("c", Ok("Tool version 9.9.9\n")),
        ]);

        let command = detect_with(&[tool("a"), tool("b"), tool("c")], &prober)
            .await
            .unwrap();

        assert_eq!(command.base.program(), "b");
        assert_eq!(command.version, Version::new(2, 10, 0));
        assert_eq!(prober.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_no_backend_found() {
        let prober = ScriptedProber::new(&[]);

        let err = detect(&prober).await.unwrap_err();

        match err {
            CmdError::NoBackendFound { tried } => {
                assert_eq!(tried, vec![DOCKER_COMPOSE, DOCKER_COMPOSE_STANDALONE, PODMAN_COMPOSE]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unparsable_version_fails_outright() {
        let prober = ScriptedProber::new(&[
            ("a", Ok("Tool version unknown\n")),
            ("b", Ok("Tool version 2.10.0\n")),
        ]);

        let err = detect_with(&[tool("a"), tool("b")], &prober).await.unwrap_err();
        assert!(matches!(err, CmdError::VersionParse { .. }));
        assert_eq!(prober.calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_priority_order_of_builtin_candidates() {
        let prober = ScriptedProber::new(&[
            ("docker-compose", Ok("docker-compose version 1.29.2, build 5becea4c\n")),
            (
                "podman-compose",
                Ok("podman-compose version 1.0.6\n['podman', '--version', '']\nusing podman version: 4.3.1\n"),
            ),
        ]);

        let command = detect(&prober).await.unwrap();
        assert!(command.base.is(DOCKER_COMPOSE_STANDALONE));
        assert_eq!(command.version, Version::new(1, 29, 2));
    }

    #[tokio::test]
    async fn test_podman_compose_banner() {
        let prober = ScriptedProber::new(&[(
            "podman-compose",
            Ok("podman-compose version 1.0.6\n['podman', '--version', '']\nusing podman version: 4.3.1\npodman-compose version 1.0.6\npodman --version \npodman version 4.3.1\nexit code: 0\n"),
        )]);

        let command = detect(&prober).await.unwrap();
        assert!(command.base.is(PODMAN_COMPOSE));
        assert_eq!(command.version, Version::new(1, 0, 6));
        assert!(command.reports_exit_code_in_output());
    }

    #[rstest]
    #[case("Docker Compose version v2.10.0\n", "2.10.0")]
    #[case("Docker Compose version 2.20.2-desktop.1\n", "2.20.2-desktop.1")]
    #[case("docker-compose version 1.29.2, build 5becea4c\n", "1.29.2")]
    #[case("warning: something\nDocker Compose version v2.3.3\n", "2.3.3")]
    fn test_docker_banners(#[case] output: &str, #[case] expected: &str) {
        let candidate = &compose_candidates()[0];
        let token = candidate.version_token(output).unwrap();
        assert_eq!(parse_version(token).unwrap(), Version::parse(expected).unwrap());
    }

    #[rstest]
    #[case("2.10", Version::new(2, 10, 0))]
    #[case("v3", Version::new(3, 0, 0))]
    #[case("1.0.6 extra", Version::new(1, 0, 6))]
    fn test_parse_version_padding(#[case] raw: &str, #[case] expected: Version) {
        assert_eq!(parse_version(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("unknown")]
    #[case("1.x.0")]
    fn test_parse_version_rejects(#[case] raw: &str) {
        assert!(parse_version(raw).is_err());
    }
}

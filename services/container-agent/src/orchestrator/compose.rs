//! Container groups: compose projects installed from a compose file or a
//! bundle archive.
//!
//! Each project lives in `<persistent dir>/compose/<project>` together with
//! a `version` file holding the installed module version. Compose itself
//! runs through whichever backend the resolver detected.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tar::Archive;
use tedge_container_cmdbuilder::{
    check_exit_code_marker, default_compose_rules, last_exit_code, CmdError, FlagRule, RuntimeCommand,
};
use tracing::{error, info, warn};

use super::pull::{pull_image, CredentialSource, NoCredentials, PullPolicy};
use crate::engine::{ContainerEngine, FilterSpec, LABEL_COMPOSE_PROJECT, LABEL_COMPOSE_WORKING_DIR};
use crate::error::AgentError;

pub const COMPOSE_FILE: &str = "docker-compose.yaml";
pub const COMPOSE_FILE_ALT: &str = "docker-compose.yml";
pub const VERSION_FILE: &str = "version";

/// Reported when a project has no version file.
pub const DEFAULT_VERSION: &str = "latest";

// =============================================================================
// Process execution
// =============================================================================

/// Result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Runs external programs.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<ProcessOutput, AgentError>;
}

/// Spawns the process and copies its output to our stderr.
///
/// Stdout is reserved for the plugin protocol, so nothing from the
/// child reaches it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<ProcessOutput, AgentError> {
        info!(program = %program, args = %args.join(" "), dir = %cwd.display(), "Running command");
        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(cwd)
            .output()
            .await?;

        let mut stderr = std::io::stderr().lock();
        stderr.write_all(&output.stdout)?;
        stderr.write_all(&output.stderr)?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ProcessOutput {
            success: output.status.success(),
            code: output.status.code(),
            output: text,
        })
    }
}

// =============================================================================
// Projects
// =============================================================================

/// Installs and removes compose projects.
pub struct ComposeProjects {
    engine: Arc<dyn ContainerEngine>,
    command: RuntimeCommand,
    rules: Vec<FlagRule>,
    runner: Arc<dyn ProcessRunner>,
    credentials: Arc<dyn CredentialSource>,
    pull_policy: PullPolicy,
    network: String,
    /// Directory holding one subdirectory per project.
    root: PathBuf,
}

impl ComposeProjects {
    pub fn new(engine: Arc<dyn ContainerEngine>, command: RuntimeCommand, root: PathBuf) -> Result<Self, AgentError> {
        Ok(Self {
            engine,
            command,
            rules: default_compose_rules()?,
            runner: Arc::new(SystemRunner),
            credentials: Arc::new(NoCredentials),
            pull_policy: PullPolicy::default(),
            network: "tedge".to_string(),
            root,
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    /// Shared network created before a project starts.
    pub fn with_network(mut self, network: &str) -> Self {
        self.network = network.to_string();
        self
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(project)
    }

    /// Install or update `project` from `file` and record `version`.
    ///
    /// `file` is either a tar (optionally gzipped) bundle, which may need
    /// building, or a plain compose file.
    pub async fn install(&self, project: &str, version: &str, file: &Path) -> Result<(), AgentError> {
        let dir = self.project_dir(project);
        info!(path = %dir.display(), "Creating project directory");
        fs::create_dir_all(&dir)?;

        let mut up_args = vec!["up", "--detach", "--remove-orphans"];
        match extract_bundle(file, &dir) {
            Ok(()) => up_args.push("--build"),
            Err(e) => {
                let dst = dir.join(COMPOSE_FILE);
                info!(src = %file.display(), dst = %dst.display(), reason = %e, "Copying file");
                fs::copy(file, &dst)?;
            }
        }

        let compose_file = compose_file_in(&dir);
        for image in read_images(&compose_file)? {
            // compose may still be able to pull it itself
            if let Err(e) = pull_image(
                self.engine.as_ref(),
                &image,
                &self.pull_policy,
                self.credentials.as_ref(),
            )
            .await
            {
                warn!(image = %image, error = %e, "Error whilst pulling images. Trying to proceed anyway");
            }
        }

        self.engine.ensure_network(&self.network).await?;

        info!(name = %project, dir = %dir.display(), "Starting compose project");
        if let Err(e) = self.compose(&dir, &up_args).await {
            error!(name = %project, error = %e, "Failed to start compose project");
            return Err(e);
        }

        let version_file = dir.join(VERSION_FILE);
        info!(path = %version_file.display(), version = %version, "Writing version to file");
        fs::write(&version_file, version)?;
        Ok(())
    }

    /// Take `project` down and delete its directory.
    pub async fn remove(&self, project: &str) -> Result<(), AgentError> {
        let dir = self.working_dir(project).await?;
        if !dir.exists() {
            return Err(AgentError::NotFound(format!(
                "compose project working directory does not exist: {}",
                dir.display()
            )));
        }

        self.compose(&dir, &["down", "--remove-orphans", "--volumes"])
            .await?;
        info!(path = %dir.display(), "Removing project directory");
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// Working directory recorded on the project's containers, if it still
    /// exists, else the default project directory.
    async fn working_dir(&self, project: &str) -> Result<PathBuf, AgentError> {
        let filter = FilterSpec {
            labels: vec![format!("{}={}", LABEL_COMPOSE_PROJECT, project)],
            ..FilterSpec::default()
        };
        let containers = self.engine.list_containers(&filter).await?;
        info!(project = %project, count = containers.len(), "Found project containers");

        let labelled = containers
            .iter()
            .filter_map(|c| c.labels.get(LABEL_COMPOSE_WORKING_DIR))
            .map(PathBuf::from)
            .find(|p| p.exists());
        match labelled {
            Some(dir) => {
                info!(project = %project, working_dir = %dir.display(), "Using project working dir found on container label");
                Ok(dir)
            }
            None => Ok(self.project_dir(project)),
        }
    }

    async fn compose(&self, dir: &Path, args: &[&str]) -> Result<(), AgentError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let (program, argv) = self.command.invocation(&args, &self.rules);
        let output = self.runner.run(&program, &argv, dir).await?;

        // The last marker overrides the process status when present.
        if self.command.reports_exit_code_in_output() && last_exit_code(&output.output).is_some() {
            return check_exit_code_marker(&output.output).map_err(AgentError::from);
        }
        if !output.success {
            return Err(AgentError::Command(CmdError::ExitCode(i64::from(output.code.unwrap_or(-1)))));
        }
        Ok(())
    }
}

/// Installed projects and their versions, sorted by name.
///
/// The version is read from the working directory on the container
/// labels, falling back to `<root>/<project>`.
pub async fn list_projects(
    engine: &dyn ContainerEngine,
    root: &Path,
) -> Result<Vec<(String, String)>, AgentError> {
    let filter = FilterSpec {
        labels: vec![LABEL_COMPOSE_PROJECT.to_string()],
        ..FilterSpec::default()
    };
    let mut projects: BTreeMap<String, PathBuf> = BTreeMap::new();
    for container in engine.list_containers(&filter).await? {
        let Some(project) = container.labels.get(LABEL_COMPOSE_PROJECT) else {
            continue;
        };
        let dir = container
            .labels
            .get(LABEL_COMPOSE_WORKING_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(project));
        projects.insert(project.clone(), dir);
    }

    Ok(projects
        .into_iter()
        .map(|(name, dir)| (name, read_version(&dir)))
        .collect())
}

/// First line of `<dir>/version`, or `latest`.
pub fn read_version(dir: &Path) -> String {
    fs::read_to_string(dir.join(VERSION_FILE))
        .ok()
        .and_then(|s| s.lines().next().map(str::to_string))
        .unwrap_or_else(|| DEFAULT_VERSION.to_string())
}

fn compose_file_in(dir: &Path) -> PathBuf {
    let primary = dir.join(COMPOSE_FILE);
    let alt = dir.join(COMPOSE_FILE_ALT);
    if !primary.exists() && alt.exists() {
        return alt;
    }
    primary
}

#[derive(Debug, Default, Deserialize)]
struct ComposeDocument {
    #[serde(default)]
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Default, Deserialize)]
struct ComposeService {
    #[serde(default)]
    image: Option<String>,
}

/// Images referenced by the services of a compose file, deduplicated.
pub fn read_images(compose_file: &Path) -> Result<Vec<String>, AgentError> {
    let contents = fs::read_to_string(compose_file)?;
    let document: ComposeDocument = serde_yaml::from_str(&contents)
        .map_err(|e| AgentError::Config(format!("{}: {}", compose_file.display(), e)))?;

    let mut images: Vec<String> = document
        .services
        .into_values()
        .filter_map(|s| s.image)
        .filter(|i| !i.is_empty())
        .collect();
    images.sort();
    images.dedup();
    Ok(images)
}

// =============================================================================
// Bundles
// =============================================================================

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TAR_MAGIC_OFFSET: usize = 257;

/// Unpack a tar or tar.gz bundle into `dest`.
///
/// Fails without touching `dest` when the file is not a tar archive.
/// Entries escaping `dest` are skipped.
pub fn extract_bundle(file: &Path, dest: &Path) -> Result<(), AgentError> {
    let mut data = fs::read(file)?;
    if data.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        GzDecoder::new(data.as_slice()).read_to_end(&mut decoded)?;
        data = decoded;
    }
    if data.get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5) != Some(b"ustar".as_slice()) {
        return Err(AgentError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "not a tar archive",
        )));
    }

    let mut archive = Archive::new(Cursor::new(data));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            warn!(path = %path.display(), "Skipping path outside of the project directory");
            continue;
        }
        entry.unpack(dest.join(&path))?;
    }
    Ok(())
}

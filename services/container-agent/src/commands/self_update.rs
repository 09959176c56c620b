//! `self` software management plugin.
//!
//! The agent's own container as a software module. Installing it is left to
//! a dedicated update workflow; `check` tells that workflow whether an
//! update list contains an update of this container.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::ContainerEngine;
use crate::error::AgentError;
use crate::orchestrator::{
    local_hostname, resolve_self, CloneSpec, Orchestrator, UpdateOutcome, UpdateRequest,
};

use super::container::{InstallArgs, RemoveArgs};
use super::CommandContext;

/// `check` found no update of this container. Finding one exits 0.
pub const CHECK_NO: i32 = 1;
pub const CHECK_ERROR: i32 = 2;

const TYPE_SELF: &str = "self";
const TYPE_CONTAINER: &str = "container";
const ACTION_INSTALL: &str = "install";
const ACTION_REMOVE: &str = "remove";

#[derive(Debug, Args)]
pub struct SelfCommand {
    #[command(subcommand)]
    command: SelfSubcommand,
}

#[derive(Debug, Subcommand)]
enum SelfSubcommand {
    /// Prepare a sequence of install/remove commands.
    Prepare,

    /// No-op: updates of this container run in a dedicated workflow.
    Install(InstallArgs),

    /// Not supported.
    Remove(RemoveArgs),

    /// Print this container and its image.
    List,

    /// Finalize a sequence of install/remove commands.
    Finalize,

    /// Update a list of modules in one go (not supported).
    UpdateList,

    /// Check whether an update list updates this container.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Update list as JSON.
    update_list: String,

    /// Name of this container, used when it cannot be detected.
    #[arg(long)]
    container: Option<String>,
}

/// One entry of an update list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SoftwareModule {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub module_type: String,
    #[serde(default)]
    pub modules: Vec<SoftwareItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareItem {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub action: String,
}

/// Answer of `check`: the update of this container and what is left to
/// install through the other plugins.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub container_name: String,
    pub image: String,
    pub update_list: Vec<SoftwareModule>,
    /// The image differs from the running one.
    pub update_required: bool,
}

impl SelfCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            SelfSubcommand::Prepare | SelfSubcommand::Finalize => Ok(()),
            SelfSubcommand::Install(args) => {
                info!(name = %args.name, "Skipping install, self updates run in their own workflow");
                Ok(())
            }
            SelfSubcommand::Remove(args) => {
                warn!(name = %args.name, "Removing the agent's own container is not supported");
                Err(AgentError::Exit {
                    code: CHECK_ERROR,
                    reason: "not supported".to_string(),
                    silent: false,
                }
                .into())
            }
            SelfSubcommand::UpdateList => {
                Err(AgentError::Unsupported("update-list".to_string()).into())
            }
            SelfSubcommand::List => {
                let engine = ctx.engine()?;
                let (name, image) = own_module(engine.as_ref(), &local_hostname().unwrap_or_default())
                    .await
                    .map_err(|e| AgentError::Exit {
                        code: CHECK_ERROR,
                        reason: e.to_string(),
                        silent: false,
                    })?;
                println!("{}\t{}", name, image);
                Ok(())
            }
            SelfSubcommand::Check(args) => match check(&ctx, &args).await {
                Ok(Some(update)) => {
                    println!(":::begin-tedge:::\n{}\n:::end-tedge:::", serde_json::to_string(&update)?);
                    Ok(())
                }
                Ok(None) => Err(AgentError::Exit {
                    code: CHECK_NO,
                    reason: "no self-update detected".to_string(),
                    silent: true,
                }
                .into()),
                Err(e) => Err(AgentError::Exit {
                    code: CHECK_ERROR,
                    reason: format!("{:#}", e),
                    silent: false,
                }
                .into()),
            },
        }
    }
}

/// Name and short image name of the container this process runs in.
async fn own_module(engine: &dyn ContainerEngine, hostname: &str) -> Result<(String, String), AgentError> {
    let current = resolve_self(engine, hostname).await?;
    let name = current.name.as_deref().unwrap_or_default().trim_start_matches('/');
    let image = current
        .config
        .as_ref()
        .and_then(|c| c.image.as_deref())
        .unwrap_or_default();
    Ok((name.to_string(), short_image_name(image).to_string()))
}

/// Image reference without its registry and repository path.
fn short_image_name(image: &str) -> &str {
    match image.rsplit_once('/') {
        Some((_, last)) if !last.is_empty() => last,
        _ => image,
    }
}

async fn check(ctx: &CommandContext, args: &CheckArgs) -> Result<Option<UpdateInfo>> {
    let modules: Vec<SoftwareModule> = serde_json::from_str(&args.update_list)
        .map_err(|e| AgentError::Config(format!("invalid update list: {}", e)))?;

    let engine = ctx.engine()?;
    let (name, id) = match resolve_self(engine.as_ref(), &local_hostname().unwrap_or_default()).await {
        Ok(current) => (
            current.name.unwrap_or_default().trim_start_matches('/').to_string(),
            current.id.unwrap_or_default(),
        ),
        Err(e) => {
            info!(error = %e, "Could not detect own container");
            (args.container.clone().unwrap_or_default(), String::new())
        }
    };

    let Some(mut update) = plan_update(modules, &name, &id)? else {
        return Ok(None);
    };
    info!(container = %update.container_name, image = %update.image, "Update includes a self update");

    // pulls the image now so a bad reference fails before the workflow starts
    let mut orchestrator = Orchestrator::new(engine)
        .with_credentials(ctx.credentials())
        .with_pull_policy(ctx.pull_policy());
    let outcome = orchestrator
        .update(&UpdateRequest {
            container: Some(update.container_name.clone()),
            spec: CloneSpec {
                image: Some(update.image.clone()),
                ..CloneSpec::default()
            },
            check_only: true,
            ..UpdateRequest::default()
        })
        .await?;
    update.update_required = outcome == UpdateOutcome::UpdateNeeded;
    Ok(Some(update))
}

/// Split the update of this container off an update list.
///
/// `self` modules and `container` modules naming this container are taken
/// out of the list. Removing this container is refused.
pub fn plan_update(
    modules: Vec<SoftwareModule>,
    own_name: &str,
    own_id: &str,
) -> Result<Option<UpdateInfo>, AgentError> {
    let mut update = UpdateInfo::default();
    let mut found = false;

    for module in modules {
        match module.module_type.as_str() {
            TYPE_SELF => {
                if let Some(item) = module.modules.iter().find(|i| i.action == ACTION_INSTALL) {
                    update.container_name = item.name.clone();
                    update.image = item.version.clone();
                    found = true;
                }
            }
            TYPE_CONTAINER => {
                let mut others = Vec::new();
                for item in module.modules {
                    if own_name.is_empty() || item.name != own_name {
                        others.push(item);
                        continue;
                    }
                    match item.action.as_str() {
                        ACTION_REMOVE => {
                            return Err(AgentError::Unsupported(format!(
                                "the agent's own container cannot be removed. name={}, version={}, containerId={}",
                                item.name, item.version, own_id
                            )))
                        }
                        ACTION_INSTALL => {
                            update.container_name = item.name;
                            update.image = item.version;
                            found = true;
                        }
                        _ => {}
                    }
                }
                if !others.is_empty() {
                    update.update_list.push(SoftwareModule {
                        module_type: module.module_type,
                        modules: others,
                    });
                }
            }
            _ => update.update_list.push(module),
        }
    }

    Ok(found.then_some(update))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockContainer, MockEngine};
    use clap::Parser;
    use rstest::rstest;

    fn modules(json: &str) -> Vec<SoftwareModule> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_container_update_of_self_is_split_off() {
        let list = modules(
            r#"[
                {"type": "container", "modules": [
                    {"name": "tedge", "version": "tedge:2.0", "action": "install"},
                    {"name": "nginx", "version": "nginx:1.27", "action": "install"}
                ]},
                {"type": "apt", "modules": [{"name": "jq", "action": "install"}]}
            ]"#,
        );

        let update = plan_update(list, "tedge", "abc").unwrap().unwrap();
        assert_eq!(update.container_name, "tedge");
        assert_eq!(update.image, "tedge:2.0");
        assert_eq!(update.update_list.len(), 2);
        assert_eq!(update.update_list[0].modules.len(), 1);
        assert_eq!(update.update_list[0].modules[0].name, "nginx");
        assert_eq!(update.update_list[1].module_type, "apt");
    }

    #[test]
    fn test_self_module() {
        let list = modules(
            r#"[{"type": "self", "modules": [
                {"name": "tedge", "version": "1.0", "action": "remove"},
                {"name": "tedge", "version": "tedge:3.0", "action": "install"}
            ]}]"#,
        );

        let update = plan_update(list, "", "").unwrap().unwrap();
        assert_eq!(update.image, "tedge:3.0");
        assert!(update.update_list.is_empty());
    }

    #[test]
    fn test_no_self_update() {
        let list = modules(r#"[{"type": "container", "modules": [{"name": "nginx", "action": "install"}]}]"#);
        assert_eq!(plan_update(list, "tedge", "abc").unwrap(), None);

        // an undetected own container never matches
        let list = modules(r#"[{"type": "container", "modules": [{"name": "", "action": "install"}]}]"#);
        assert_eq!(plan_update(list, "", "").unwrap(), None);
    }

    #[test]
    fn test_removing_self_is_refused() {
        let list = modules(r#"[{"type": "container", "modules": [{"name": "tedge", "version": "x", "action": "remove"}]}]"#);
        let err = plan_update(list, "tedge", "abc").unwrap_err();
        assert!(matches!(err, AgentError::Unsupported(_)));
        assert!(err.to_string().contains("containerId=abc"));
    }

    #[test]
    fn test_update_info_json() {
        let update = UpdateInfo {
            container_name: "tedge".into(),
            image: "tedge:2.0".into(),
            update_list: vec![SoftwareModule {
                module_type: "container".into(),
                modules: vec![SoftwareItem {
                    name: "nginx".into(),
                    action: "install".into(),
                    ..SoftwareItem::default()
                }],
            }],
            update_required: true,
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({
                "containerName": "tedge",
                "image": "tedge:2.0",
                "updateList": [{"type": "container", "modules": [{"name": "nginx", "action": "install"}]}],
                "updateRequired": true,
            })
        );
    }

    #[rstest]
    #[case("ghcr.io/thin-edge/tedge-container-bundle:20240930", "tedge-container-bundle:20240930")]
    #[case("nginx:latest", "nginx:latest")]
    #[case("trailing/", "trailing/")]
    fn test_short_image_name(#[case] image: &str, #[case] expected: &str) {
        assert_eq!(short_image_name(image), expected);
    }

    #[tokio::test]
    async fn test_own_module() {
        let engine = MockEngine::new();
        engine.add_container(
            MockContainer::new("0123456789abcdef", "tedge", "ghcr.io/thin-edge/tedge:1.0").running(),
        );

        let (name, image) = own_module(&engine, "0123456789ab").await.unwrap();
        assert_eq!(name, "tedge");
        assert_eq!(image, "tedge:1.0");

        assert!(own_module(&engine, "elsewhere").await.is_err());
    }

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(subcommand)]
        command: SelfSubcommand,
    }

    #[test]
    fn test_check_parses() {
        let argv = ["self", "check", "[]", "--container", "tedge"];
        match Harness::parse_from(argv).command {
            SelfSubcommand::Check(args) => {
                assert_eq!(args.update_list, "[]");
                assert_eq!(args.container.as_deref(), Some("tedge"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

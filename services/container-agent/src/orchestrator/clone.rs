//! Create requests derived from an existing container.

use std::collections::HashMap;

use bollard::container::NetworkingConfig;
use bollard::models::{
    ContainerConfig, EndpointSettings, HostConfig, NetworkSettings, RestartPolicy,
    RestartPolicyNameEnum,
};

use super::CloneSpec;
use crate::engine::{ContainerInspectResponse, CreateConfig, LABEL_FORK, LABEL_FORKED_NAME};

/// Labels carried by the image itself; never copied onto a clone.
const OCI_LABEL_PREFIX: &str = "org.opencontainers.";

/// Create request for a replacement of `original` following `spec`.
pub fn clone_config(original: &ContainerInspectResponse, spec: &CloneSpec) -> CreateConfig<String> {
    let mut config = container_config(original.config.as_ref(), spec);
    config.host_config = Some(host_config(original.host_config.as_ref(), spec));
    if !spec.skip_network {
        config.networking_config = Some(networking_config(original.network_settings.as_ref()));
    }
    config
}

/// Create request for the helper container that performs a self-update.
///
/// The helper runs `entrypoint`, is marked with the fork labels, never
/// restarts, and is removed once it exits.
pub fn fork_config(
    original: &ContainerInspectResponse,
    spec: &CloneSpec,
    entrypoint: Vec<String>,
) -> CreateConfig<String> {
    let mut labels = spec.fork_labels.clone();
    labels.insert(LABEL_FORK.to_string(), "1".to_string());
    labels.insert(
        LABEL_FORKED_NAME.to_string(),
        container_name(original).to_string(),
    );

    let fork_spec = CloneSpec {
        entrypoint,
        labels,
        auto_remove: true,
        ..spec.clone()
    };

    let mut config = clone_config(original, &fork_spec);
    // the original command would be appended to the helper entrypoint
    config.cmd = None;
    if let Some(host_config) = config.host_config.as_mut() {
        host_config.restart_policy = Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        });
    }
    config
}

/// Container name without the leading `/`.
pub fn container_name(container: &ContainerInspectResponse) -> &str {
    container
        .name
        .as_deref()
        .unwrap_or_default()
        .trim_start_matches('/')
}

fn container_config(original: Option<&ContainerConfig>, spec: &CloneSpec) -> CreateConfig<String> {
    let default = ContainerConfig::default();
    let original = original.unwrap_or(&default);

    let mut labels: HashMap<String, String> = original
        .labels
        .iter()
        .flatten()
        .filter(|(k, _)| !k.starts_with(OCI_LABEL_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.extend(spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut env = original.env.clone().unwrap_or_default();
    env.extend(spec.env.iter().cloned());

    CreateConfig {
        user: original.user.clone(),
        cmd: if spec.cmd.is_empty() {
            original.cmd.clone()
        } else {
            Some(spec.cmd.clone())
        },
        entrypoint: if spec.entrypoint.is_empty() {
            original.entrypoint.clone()
        } else {
            Some(spec.entrypoint.clone())
        },
        env: Some(env),
        network_disabled: Some(false),
        stop_signal: original.stop_signal.clone(),
        image: spec.image.clone().or_else(|| original.image.clone()),
        volumes: original.volumes.clone(),
        tty: original.tty,
        exposed_ports: original.exposed_ports.clone(),
        domainname: original.domainname.clone(),
        labels: Some(labels),
        ..Default::default()
    }
}

fn host_config(original: Option<&HostConfig>, spec: &CloneSpec) -> HostConfig {
    let default = HostConfig::default();
    let original = original.unwrap_or(&default);

    let mut extra_hosts = original.extra_hosts.clone().unwrap_or_default();
    extra_hosts.extend(spec.extra_hosts.iter().cloned());

    let mut host = HostConfig {
        binds: original.binds.clone(),
        auto_remove: Some(spec.auto_remove),
        cap_add: original.cap_add.clone(),
        cap_drop: original.cap_drop.clone(),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        }),
        dns: original.dns.clone(),
        dns_options: original.dns_options.clone(),
        dns_search: original.dns_search.clone(),
        links: original.links.clone(),
        privileged: original.privileged,
        mounts: original.mounts.clone(),
        tmpfs: original.tmpfs.clone(),
        port_bindings: original.port_bindings.clone(),
        publish_all_ports: original.publish_all_ports,
        extra_hosts: Some(extra_hosts),
        oom_score_adj: original.oom_score_adj,
        readonly_rootfs: original.readonly_rootfs,
        volume_driver: original.volume_driver.clone(),
        volumes_from: original.volumes_from.clone(),
        init: original.init,
        log_config: original.log_config.clone(),
        storage_opt: original.storage_opt.clone(),
        readonly_paths: original.readonly_paths.clone(),
        security_opt: original.security_opt.clone(),
        group_add: original.group_add.clone(),
        runtime: original.runtime.clone(),
        container_id_file: original.container_id_file.clone(),
        network_mode: if spec.skip_network {
            Some("none".to_string())
        } else {
            original.network_mode.clone()
        },
        ..Default::default()
    };

    if spec.ignore_port_conflicts {
        host.port_bindings = Some(HashMap::new());
        host.publish_all_ports = Some(false);
    }
    host
}

/// One endpoint per attached network, carrying only the network id.
fn networking_config(settings: Option<&NetworkSettings>) -> NetworkingConfig<String> {
    let endpoints_config = settings
        .and_then(|s| s.networks.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|(name, endpoint)| {
            let id = endpoint.network_id.as_deref().filter(|id| !id.is_empty())?;
            Some((
                name.clone(),
                EndpointSettings {
                    network_id: Some(id.to_string()),
                    ..Default::default()
                },
            ))
        })
        .collect();
    NetworkingConfig { endpoints_config }
}

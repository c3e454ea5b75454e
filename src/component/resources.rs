//! Kubernetes resource builders for a devfile component
//!
//! This module turns the devfile's container and volume components into the
//! Deployment, Service and PersistentVolumeClaims of the component workload.
//! Nothing here talks to the cluster.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvFromSource, EnvVar,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecretEnvSource, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::executor::shell_command_line;
use super::labels::*;
use crate::devfile::{Devfile, DevfileCommand, ExecCommand, PushCommands};
use crate::error::{Error, Result};

/// Kubernetes names are limited to 63 characters
const MAX_NAME_LEN: usize = 63;

/// Everything needed to render the workload of one component
pub struct WorkloadParams<'a> {
    pub component: &'a str,
    pub namespace: &'a str,
    pub app: &'a str,
    pub devfile: &'a Devfile,
    pub commands: &'a PushCommands,
    pub debug_port: i32,
    /// Secrets published by the component's service bindings
    pub bound_secrets: &'a [String],
    /// Devfile volume name to claim name
    pub volume_claims: &'a BTreeMap<String, String>,
    pub bootstrap_image: &'a str,
}

/// Desired Deployment and Service for a component
#[derive(Clone, Debug)]
pub struct Workload {
    pub deployment: Deployment,
    pub service: Service,
}

pub fn build_workload(params: &WorkloadParams<'_>) -> Result<Workload> {
    let labels = standard_labels(params.component, params.app, params.devfile.component_type());

    let mut containers = build_containers(params.devfile)?;
    add_project_volume_mounts(&mut containers);
    wire_supervisord(&mut containers, params.commands, params.debug_port)?;
    if let Some(run_container) = params.commands.run.component() {
        attach_bound_secrets(&mut containers, run_container, params.bound_secrets);
    }

    // Pre-start containers inherit env and mounts of the wired containers
    let mut init_containers = pre_start_init_containers(params.devfile, &containers)?;
    init_containers.push(supervisord_init_container(params.bootstrap_image));

    let mut volumes = attach_volumes(&mut containers, params.devfile, params.volume_claims)?;
    volumes.extend(mandatory_volumes());

    let meta = object_meta(params.component, params.namespace, &labels);
    let deployment = build_deployment(
        meta.clone(),
        params.component,
        init_containers,
        containers,
        volumes,
    );
    let service = build_service(meta, params.component, params.devfile);

    Ok(Workload {
        deployment,
        service,
    })
}

fn object_meta(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn truncate_name(name: String) -> String {
    truncate_to(name, MAX_NAME_LEN)
}

/// Cut `name` to at most `max` bytes on a char boundary
fn truncate_to(mut name: String, max: usize) -> String {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.truncate(end);
    name.trim_end_matches('-').to_string()
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn set_env_if_absent(container: &mut Container, name: &str, value: impl Into<String>) {
    let env = container.env.get_or_insert_with(Vec::new);
    if !env.iter().any(|e| e.name == name) {
        env.push(env_var(name, value));
    }
}

fn add_volume_mount(container: &mut Container, name: &str, path: &str) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    if !mounts.iter().any(|m| m.name == name) {
        mounts.push(VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..Default::default()
        });
    }
}

// ============================================================================
// Containers
// ============================================================================

/// Build one container per devfile container component
pub fn build_containers(devfile: &Devfile) -> Result<Vec<Container>> {
    let containers: Vec<Container> = devfile
        .containers()
        .map(|(name, spec)| {
            let mut env: Vec<EnvVar> = spec
                .env
                .iter()
                .map(|e| env_var(&e.name, e.value.clone()))
                .collect();
            if spec.mounts_sources() {
                env.push(env_var(ENV_PROJECTS_ROOT, spec.source_path()));
            }

            let ports: Vec<ContainerPort> = spec
                .endpoints
                .iter()
                .map(|ep| ContainerPort {
                    name: Some(truncate_name(ep.name.clone())),
                    container_port: ep.target_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .collect();

            let resources = spec.memory_limit.as_ref().map(|limit| ResourceRequirements {
                limits: Some(BTreeMap::from([(
                    "memory".to_string(),
                    Quantity(limit.clone()),
                )])),
                ..Default::default()
            });

            Container {
                name: name.to_string(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("Always".to_string()),
                env: if env.is_empty() { None } else { Some(env) },
                ports: if ports.is_empty() { None } else { Some(ports) },
                resources,
                command: if spec.command.is_empty() {
                    None
                } else {
                    Some(spec.command.clone())
                },
                args: if spec.args.is_empty() {
                    None
                } else {
                    Some(spec.args.clone())
                },
                ..Default::default()
            }
        })
        .collect();

    if containers.is_empty() {
        return Err(Error::NoValidContainers);
    }
    Ok(containers)
}

/// Mount the shared project volume wherever a container expects sources
pub fn add_project_volume_mounts(containers: &mut [Container]) {
    for container in containers.iter_mut() {
        let path = container
            .env
            .as_ref()
            .and_then(|env| env.iter().find(|e| e.name == ENV_PROJECTS_ROOT))
            .and_then(|e| e.value.clone());
        if let Some(path) = path {
            add_volume_mount(container, PROJECTS_VOLUME_NAME, &path);
        }
    }
}

fn supervised_exec(cmd: &DevfileCommand) -> Result<&ExecCommand> {
    cmd.exec.as_ref().ok_or_else(|| {
        Error::ValidationError(format!(
            "the command \"{}\" must be an exec command to run under supervisord",
            cmd.id
        ))
    })
}

/// Make the run (and debug) containers start supervisord and hand it the
/// command lines through env vars.
pub fn wire_supervisord(
    containers: &mut [Container],
    commands: &PushCommands,
    debug_port: i32,
) -> Result<()> {
    let run = supervised_exec(&commands.run)?;
    let container = find_container(containers, &run.component)?;
    prepare_supervised_container(container);
    set_env_if_absent(container, ENV_COMMAND_RUN, run.command_line.clone());
    if let Some(dir) = run.working_dir.as_ref() {
        set_env_if_absent(container, ENV_COMMAND_RUN_WORKING_DIR, dir.clone());
    }

    if let Some(debug_cmd) = commands.debug.as_ref() {
        let debug = supervised_exec(debug_cmd)?;
        let container = find_container(containers, &debug.component)?;
        prepare_supervised_container(container);
        set_env_if_absent(container, ENV_COMMAND_DEBUG, debug.command_line.clone());
        if let Some(dir) = debug.working_dir.as_ref() {
            set_env_if_absent(container, ENV_COMMAND_DEBUG_WORKING_DIR, dir.clone());
        }
        set_env_if_absent(container, ENV_DEBUG_PORT, debug_port.to_string());
    }

    Ok(())
}

fn find_container<'a>(containers: &'a mut [Container], name: &str) -> Result<&'a mut Container> {
    containers
        .iter_mut()
        .find(|c| c.name == name)
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "container component \"{name}\" referenced by the run command is not found"
            ))
        })
}

fn prepare_supervised_container(container: &mut Container) {
    let no_command = container.command.as_ref().map_or(true, |c| c.is_empty());
    let no_args = container.args.as_ref().map_or(true, |a| a.is_empty());
    if no_command && no_args {
        container.command = Some(vec![SUPERVISORD_BINARY_PATH.to_string()]);
        container.args = Some(vec!["-c".to_string(), SUPERVISORD_CONF_FILE.to_string()]);
    }
    add_volume_mount(container, SUPERVISORD_VOLUME_NAME, SUPERVISORD_MOUNT_PATH);
}

/// Expose each bound secret to the run container as env vars
pub fn attach_bound_secrets(containers: &mut [Container], run_container: &str, secrets: &[String]) {
    if secrets.is_empty() {
        return;
    }
    if let Some(container) = containers.iter_mut().find(|c| c.name == run_container) {
        let env_from = container.env_from.get_or_insert_with(Vec::new);
        for secret in secrets {
            let already = env_from.iter().any(|e| {
                e.secret_ref
                    .as_ref()
                    .and_then(|s| s.name.as_deref())
                    == Some(secret.as_str())
            });
            if !already {
                env_from.push(EnvFromSource {
                    secret_ref: Some(SecretEnvSource {
                        name: Some(secret.clone()),
                        optional: None,
                    }),
                    ..Default::default()
                });
            }
        }
    }
}

/// Init container installing the supervisord binary and config into the
/// shared supervisor volume
pub fn supervisord_init_container(image: &str) -> Container {
    Container {
        name: SUPERVISORD_INIT_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/usr/bin/cp".to_string()]),
        args: Some(vec![
            "-r".to_string(),
            "/opt/devpush-init/.".to_string(),
            SUPERVISORD_MOUNT_PATH.to_string(),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: SUPERVISORD_VOLUME_NAME.to_string(),
            mount_path: SUPERVISORD_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Turn the devfile's preStart event commands into init containers, in
/// declaration order. Composite commands expand to their exec steps.
pub fn pre_start_init_containers(devfile: &Devfile, containers: &[Container]) -> Result<Vec<Container>> {
    let mut steps: Vec<(String, ExecCommand)> = Vec::new();
    for id in &devfile.events.pre_start {
        collect_exec_steps(devfile, id, &mut steps, 0)?;
    }

    steps
        .into_iter()
        .map(|(id, exec)| {
            let base = containers
                .iter()
                .find(|c| c.name == exec.component)
                .ok_or_else(|| {
                    Error::ValidationError(format!(
                        "preStart command \"{id}\" references an invalid container component \"{}\"",
                        exec.component
                    ))
                })?;
            Ok(Container {
                name: truncate_name(format!("{}-{}", id.to_lowercase(), base.name)),
                image: base.image.clone(),
                env: base.env.clone(),
                env_from: base.env_from.clone(),
                volume_mounts: base.volume_mounts.clone(),
                resources: base.resources.clone(),
                command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                args: Some(vec![shell_command_line(&exec)]),
                ..Default::default()
            })
        })
        .collect()
}

fn collect_exec_steps(
    devfile: &Devfile,
    id: &str,
    steps: &mut Vec<(String, ExecCommand)>,
    depth: usize,
) -> Result<()> {
    if depth > devfile.commands.len() {
        return Err(Error::ValidationError(format!(
            "composite command \"{id}\" is cyclic"
        )));
    }
    let cmd = devfile.command(id).ok_or_else(|| {
        Error::ValidationError(format!("the command \"{id}\" is not found in the devfile"))
    })?;
    match (&cmd.exec, &cmd.composite) {
        (Some(exec), _) => steps.push((cmd.id.clone(), exec.clone())),
        (None, Some(composite)) => {
            for sub in &composite.commands {
                collect_exec_steps(devfile, sub, steps, depth + 1)?;
            }
        }
        (None, None) => {
            return Err(Error::ValidationError(format!(
                "the command \"{id}\" must be an exec or a composite command"
            )))
        }
    }
    Ok(())
}

// ============================================================================
// Volumes
// ============================================================================

/// Claim name for a devfile volume of a component
pub fn pvc_name(component: &str, volume: &str) -> String {
    truncate_name(format!("{component}-{volume}"))
}

/// Claim name for a devfile volume that is not held by any claim in
/// `taken`. A claim being deleted keeps its name until its finalizers clear,
/// so its replacement gets a numbered suffix.
pub fn available_pvc_name(component: &str, volume: &str, taken: &BTreeSet<String>) -> String {
    let base = format!("{component}-{volume}");
    let name = truncate_name(base.clone());
    if !taken.contains(&name) {
        return name;
    }
    (1..)
        .map(|n| {
            let suffix = format!("-{n}");
            format!("{}{suffix}", truncate_to(base.clone(), MAX_NAME_LEN - suffix.len()))
        })
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(name)
}

fn pvc_volume_name(claim: &str) -> String {
    truncate_name(format!("{claim}-vol"))
}

/// Mount the declared devfile volumes into their containers and return the
/// pod volumes backing them. Ephemeral volumes use `emptyDir`; the rest must
/// have a claim in `claims`.
pub fn attach_volumes(
    containers: &mut [Container],
    devfile: &Devfile,
    claims: &BTreeMap<String, String>,
) -> Result<Vec<Volume>> {
    let mut volumes: Vec<Volume> = Vec::new();

    for (container_name, spec) in devfile.containers() {
        for mount in &spec.volume_mounts {
            let (_, volume) = devfile
                .volumes()
                .find(|(name, _)| *name == mount.name)
                .ok_or_else(|| {
                    Error::ValidationError(format!(
                        "container \"{container_name}\" mounts volume \"{}\" which is not declared in the devfile",
                        mount.name
                    ))
                })?;

            let pod_volume = if volume.ephemeral {
                Volume {
                    name: mount.name.clone(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                }
            } else {
                let claim = claims.get(&mount.name).ok_or_else(|| {
                    Error::ConfigError(format!(
                        "unable to find the PVC for volume \"{}\"",
                        mount.name
                    ))
                })?;
                Volume {
                    name: pvc_volume_name(claim),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.clone(),
                        read_only: None,
                    }),
                    ..Default::default()
                }
            };

            if let Some(container) = containers.iter_mut().find(|c| c.name == container_name) {
                add_volume_mount(container, &pod_volume.name, &mount.mount_path());
            }
            if !volumes.iter().any(|v| v.name == pod_volume.name) {
                volumes.push(pod_volume);
            }
        }
    }

    Ok(volumes)
}

/// Project source and supervisor volumes every component pod carries
pub fn mandatory_volumes() -> Vec<Volume> {
    vec![
        Volume {
            name: PROJECTS_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: SUPERVISORD_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ]
}

pub fn build_pvc(
    component: &str,
    namespace: &str,
    app: &str,
    volume: &str,
    size: &str,
) -> PersistentVolumeClaim {
    let mut labels = standard_labels(component, app, "");
    labels.insert(STORAGE_LABEL.to_string(), volume.to_string());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(component, volume)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Deployment
// ============================================================================

fn build_deployment(
    metadata: ObjectMeta,
    component: &str,
    init_containers: Vec<Container>,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
) -> Deployment {
    let selector = selector_labels(component);

    Deployment {
        metadata: metadata.clone(),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            // Single replica with RWO claims: the old pod must go first
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                rolling_update: None,
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(component.to_string()),
                    labels: metadata.labels,
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(init_containers),
                    containers,
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Service
// ============================================================================

/// Service exposing every non-`none` endpoint; it may end up without ports
pub fn build_service(metadata: ObjectMeta, component: &str, devfile: &Devfile) -> Service {
    let mut ports: Vec<ServicePort> = Vec::new();
    for (_, spec) in devfile.containers() {
        for ep in spec.endpoints.iter().filter(|ep| ep.is_exposed()) {
            if ports.iter().any(|p| p.port == ep.target_port) {
                continue;
            }
            ports.push(ServicePort {
                name: Some(truncate_name(ep.name.clone())),
                port: ep.target_port,
                target_port: Some(IntOrString::Int(ep.target_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
    }

    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(component)),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn service_port_count(service: &Service) -> usize {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(Vec::len)
        .unwrap_or(0)
}

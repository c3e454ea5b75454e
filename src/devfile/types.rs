//! Devfile types consumed by the component adapter
//!
//! Only the subset of the devfile 2.x schema that drives resource generation
//! and command execution is modelled here:
//!
//! - [`DevfileComponent`] - a `container` or a `volume` entry
//! - [`DevfileCommand`] - an `exec` or a `composite` command
//! - [`Events`] - lifecycle event bindings to command ids

use serde::{Deserialize, Serialize};

/// Source mount path used when a container does not set `sourceMapping`
pub const DEFAULT_SOURCE_MAPPING: &str = "/projects";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Devfile {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub components: Vec<DevfileComponent>,
    #[serde(default)]
    pub commands: Vec<DevfileCommand>,
    #[serde(default)]
    pub events: Events,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DevfileComponent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeComponent>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerComponent {
    pub image: String,
    #[serde(default)]
    pub env: Vec<EnvVarDef>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    /// Defaults to `true` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_sources: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_mapping: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMountDef>,
}

impl ContainerComponent {
    pub fn mounts_sources(&self) -> bool {
        self.mount_sources.unwrap_or(true)
    }

    pub fn source_path(&self) -> &str {
        self.source_mapping
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_SOURCE_MAPPING)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarDef {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    pub target_port: i32,
    /// `public`, `internal` or `none`; `none` keeps the port off the Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<String>,
}

impl Endpoint {
    pub fn is_exposed(&self) -> bool {
        !matches!(self.exposure.as_deref(), Some("none"))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMountDef {
    pub name: String,
    /// Defaults to `/<name>` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl VolumeMountDef {
    pub fn mount_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/{}", self.name))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default)]
    pub ephemeral: bool,
}

/// Command group kinds a devfile command can belong to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandGroupKind {
    Build,
    Run,
    Test,
    Debug,
}

impl std::fmt::Display for CommandGroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandGroupKind::Build => write!(f, "build"),
            CommandGroupKind::Run => write!(f, "run"),
            CommandGroupKind::Test => write!(f, "test"),
            CommandGroupKind::Debug => write!(f, "debug"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandGroup {
    pub kind: CommandGroupKind,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DevfileCommand {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<CompositeCommand>,
}

impl DevfileCommand {
    pub fn group(&self) -> Option<&CommandGroup> {
        match (&self.exec, &self.composite) {
            (Some(exec), _) => exec.group.as_ref(),
            (None, Some(composite)) => composite.group.as_ref(),
            (None, None) => None,
        }
    }

    pub fn kind(&self) -> Option<CommandGroupKind> {
        self.group().map(|g| g.kind)
    }

    pub fn is_default(&self) -> bool {
        self.group().map(|g| g.is_default).unwrap_or(false)
    }

    /// Container the command runs in, for `exec` commands
    pub fn component(&self) -> Option<&str> {
        self.exec.as_ref().map(|e| e.component.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCommand {
    pub command_line: String,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVarDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<CommandGroup>,
    #[serde(default)]
    pub hot_reload_capable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeCommand {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<CommandGroup>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Events {
    #[serde(default)]
    pub pre_start: Vec<String>,
    #[serde(default)]
    pub post_start: Vec<String>,
    #[serde(default)]
    pub pre_stop: Vec<String>,
    #[serde(default)]
    pub post_stop: Vec<String>,
}

/// Lifecycle hook a command list is bound to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    PreStart,
    PostStart,
    PreStop,
    PostStop,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleEvent::PreStart => write!(f, "preStart"),
            LifecycleEvent::PostStart => write!(f, "postStart"),
            LifecycleEvent::PreStop => write!(f, "preStop"),
            LifecycleEvent::PostStop => write!(f, "postStop"),
        }
    }
}

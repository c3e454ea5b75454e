//! Per-push inputs, resolved once before anything is mutated

use std::path::PathBuf;

use crate::config::{EnvInfo, RunMode, DEFAULT_DEBUG_PORT};
use crate::devfile::commands::validate_resource_name;
use crate::devfile::{
    validate_and_get_debug_command, validate_and_get_push_commands, Devfile, PushCommands,
};
use crate::error::Result;

/// What the caller asked a push to do
#[derive(Clone, Debug, Default)]
pub struct PushParameters {
    pub build_command: Option<String>,
    pub run_command: Option<String>,
    pub debug_command: Option<String>,
    pub debug: bool,
    pub debug_port: Option<i32>,
    /// Sync every file and execute commands regardless of changes
    pub force_build: bool,
    pub show: bool,
    /// Local project root holding the sources to sync
    pub project_dir: PathBuf,
}

/// Immutable state of one push, built from the parameters and the
/// persisted env info. Nothing in it outlives the pass.
#[derive(Clone, Debug)]
pub struct PushContext {
    pub component: String,
    pub namespace: String,
    pub app: String,
    pub commands: PushCommands,
    pub debug: bool,
    pub debug_port: i32,
    pub run_mode: RunMode,
    pub previous_run_mode: RunMode,
    /// ServiceBinding names the run container takes secrets from
    pub links: Vec<String>,
    pub force_build: bool,
    pub show: bool,
    pub project_dir: PathBuf,
}

impl PushContext {
    /// Validate names and resolve the build, run and (when debugging) debug
    /// commands.
    pub fn new(
        devfile: &Devfile,
        component: &str,
        app: &str,
        params: PushParameters,
        env: &EnvInfo,
    ) -> Result<Self> {
        validate_resource_name("component name", component)?;
        validate_resource_name("component namespace", &env.namespace)?;

        let mut commands = validate_and_get_push_commands(
            devfile,
            params.build_command.as_deref(),
            params.run_command.as_deref(),
        )?;

        let run_mode = if params.debug {
            commands.debug = Some(validate_and_get_debug_command(
                devfile,
                params.debug_command.as_deref(),
            )?);
            RunMode::Debug
        } else {
            RunMode::Run
        };

        Ok(Self {
            component: component.to_string(),
            namespace: env.namespace.clone(),
            app: app.to_string(),
            commands,
            debug: params.debug,
            debug_port: params
                .debug_port
                .or(env.debug_port)
                .unwrap_or(DEFAULT_DEBUG_PORT),
            run_mode,
            previous_run_mode: env.previous_run_mode(),
            links: env.links.iter().map(|l| l.name.clone()).collect(),
            force_build: params.force_build,
            show: params.show,
            project_dir: params.project_dir,
        })
    }

    pub fn run_mode_changed(&self) -> bool {
        self.run_mode != self.previous_run_mode
    }
}

//! Command resolution and validation
//!
//! A command for a group is selected by explicit id, else the group's
//! default command, else the group's only command.

use std::collections::HashSet;

use super::{CommandGroupKind, Devfile, DevfileCommand};
use crate::error::{Error, Result};

/// Commands selected for a push
#[derive(Clone, Debug, PartialEq)]
pub struct PushCommands {
    pub build: Option<DevfileCommand>,
    pub run: DevfileCommand,
    pub debug: Option<DevfileCommand>,
}

impl PushCommands {
    /// The command whose program the supervisor is expected to keep running
    pub fn active_run(&self, debug: bool) -> &DevfileCommand {
        match (&self.debug, debug) {
            (Some(cmd), true) => cmd,
            _ => &self.run,
        }
    }
}

/// Resolve and validate the build (optional) and run (required) commands.
pub fn validate_and_get_push_commands(
    devfile: &Devfile,
    build_cmd: Option<&str>,
    run_cmd: Option<&str>,
) -> Result<PushCommands> {
    let build = resolve_group(devfile, CommandGroupKind::Build, build_cmd)?;
    let run = resolve_group(devfile, CommandGroupKind::Run, run_cmd)?
        .ok_or_else(|| missing_group(CommandGroupKind::Run))?;

    Ok(PushCommands {
        build,
        run,
        debug: None,
    })
}

pub fn validate_and_get_debug_command(
    devfile: &Devfile,
    debug_cmd: Option<&str>,
) -> Result<DevfileCommand> {
    resolve_group(devfile, CommandGroupKind::Debug, debug_cmd)?
        .ok_or_else(|| missing_group(CommandGroupKind::Debug))
}

pub fn validate_and_get_test_command(
    devfile: &Devfile,
    test_cmd: Option<&str>,
) -> Result<DevfileCommand> {
    resolve_group(devfile, CommandGroupKind::Test, test_cmd)?
        .ok_or_else(|| missing_group(CommandGroupKind::Test))
}

fn missing_group(kind: CommandGroupKind) -> Error {
    Error::ValidationError(format!(
        "the command type \"{kind}\" is not found in the devfile"
    ))
}

fn resolve_group(
    devfile: &Devfile,
    kind: CommandGroupKind,
    requested: Option<&str>,
) -> Result<Option<DevfileCommand>> {
    if let Some(id) = requested.filter(|id| !id.is_empty()) {
        let cmd = devfile.command(id).ok_or_else(|| {
            Error::ValidationError(format!("the command \"{id}\" is not found in the devfile"))
        })?;
        if cmd.kind() != Some(kind) {
            return Err(Error::ValidationError(format!(
                "command group mismatch, command \"{id}\" is not of group {kind} in the devfile"
            )));
        }
        validate_command(devfile, cmd)?;
        return Ok(Some(cmd.clone()));
    }

    let candidates: Vec<&DevfileCommand> = devfile
        .commands
        .iter()
        .filter(|c| c.kind() == Some(kind))
        .collect();
    let defaults: Vec<&DevfileCommand> = candidates
        .iter()
        .copied()
        .filter(|c| c.is_default())
        .collect();

    let selected = match (defaults.len(), candidates.len()) {
        (1, _) => defaults[0],
        (0, 0) => return Ok(None),
        (0, 1) => candidates[0],
        (0, _) => {
            return Err(Error::ValidationError(format!(
                "there should be exactly one default command for command group {kind}, currently there is no default command"
            )))
        }
        _ => {
            return Err(Error::ValidationError(format!(
                "there should be exactly one default command for command group {kind}, currently there is more than one default command"
            )))
        }
    };

    validate_command(devfile, selected)?;
    Ok(Some(selected.clone()))
}

/// Check an exec command targets a declared container, or that a composite
/// command only references existing, non-cyclic commands.
pub fn validate_command(devfile: &Devfile, cmd: &DevfileCommand) -> Result<()> {
    let mut visiting = HashSet::new();
    validate_inner(devfile, cmd, &mut visiting)
}

fn validate_inner(
    devfile: &Devfile,
    cmd: &DevfileCommand,
    visiting: &mut HashSet<String>,
) -> Result<()> {
    if !visiting.insert(cmd.id.to_lowercase()) {
        return Err(Error::ValidationError(format!(
            "composite command \"{}\" references itself",
            cmd.id
        )));
    }

    match (&cmd.exec, &cmd.composite) {
        (Some(exec), _) => {
            if exec.command_line.trim().is_empty() {
                return Err(Error::ValidationError(format!(
                    "the command \"{}\" has an empty command line",
                    cmd.id
                )));
            }
            if devfile.container(&exec.component).is_none() {
                return Err(Error::ValidationError(format!(
                    "the command \"{}\" references an invalid container component \"{}\"",
                    cmd.id, exec.component
                )));
            }
        }
        (None, Some(composite)) => {
            for id in &composite.commands {
                let sub = devfile.command(id).ok_or_else(|| {
                    Error::ValidationError(format!(
                        "composite command \"{}\" references command \"{id}\" which is not found in the devfile",
                        cmd.id
                    ))
                })?;
                validate_inner(devfile, sub, visiting)?;
            }
        }
        (None, None) => {
            return Err(Error::ValidationError(format!(
                "the command \"{}\" must be an exec or a composite command",
                cmd.id
            )))
        }
    }

    visiting.remove(&cmd.id.to_lowercase());
    Ok(())
}

/// Validate a Kubernetes resource name (DNS-1123 label).
pub fn validate_resource_name(field: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(Error::ValidationError(format!(
            "{field} \"{name}\" is not valid: it must consist of at most 63 lower case alphanumeric characters or '-', and must start and end with an alphanumeric character"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devfile::{
        CommandGroup, CompositeCommand, ContainerComponent, DevfileComponent, ExecCommand,
    };

    fn exec(id: &str, kind: CommandGroupKind, is_default: bool) -> DevfileCommand {
        DevfileCommand {
            id: id.to_string(),
            exec: Some(ExecCommand {
                command_line: format!("echo {id}"),
                component: "runtime".to_string(),
                group: Some(CommandGroup { kind, is_default }),
                ..Default::default()
            }),
            composite: None,
        }
    }

    fn devfile(commands: Vec<DevfileCommand>) -> Devfile {
        Devfile {
            components: vec![DevfileComponent {
                name: "runtime".to_string(),
                container: Some(ContainerComponent {
                    image: "node:18".to_string(),
                    ..Default::default()
                }),
                volume: None,
            }],
            commands,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_commands_are_selected() {
        let df = devfile(vec![
            exec("build1", CommandGroupKind::Build, false),
            exec("build2", CommandGroupKind::Build, true),
            exec("run", CommandGroupKind::Run, false),
        ]);
        let cmds = validate_and_get_push_commands(&df, None, None).unwrap();
        assert_eq!(cmds.build.unwrap().id, "build2");
        assert_eq!(cmds.run.id, "run");
    }

    #[test]
    fn test_build_is_optional_but_run_is_required() {
        let df = devfile(vec![exec("build", CommandGroupKind::Build, true)]);
        let err = validate_and_get_push_commands(&df, None, None).unwrap_err();
        assert!(err.to_string().contains("\"run\" is not found"));

        let df = devfile(vec![exec("run", CommandGroupKind::Run, true)]);
        let cmds = validate_and_get_push_commands(&df, None, None).unwrap();
        assert!(cmds.build.is_none());
    }

    #[test]
    fn test_named_command_must_exist_and_match_group() {
        let df = devfile(vec![
            exec("run", CommandGroupKind::Run, true),
            exec("build", CommandGroupKind::Build, true),
        ]);
        let err = validate_and_get_push_commands(&df, None, Some("missing")).unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));

        let err = validate_and_get_push_commands(&df, None, Some("build")).unwrap_err();
        assert!(err.to_string().contains("group mismatch"));
    }

    #[test]
    fn test_multiple_candidates_without_default_fail() {
        let df = devfile(vec![
            exec("run1", CommandGroupKind::Run, false),
            exec("run2", CommandGroupKind::Run, false),
        ]);
        let err = validate_and_get_push_commands(&df, None, None).unwrap_err();
        assert!(err.to_string().contains("no default command"));
    }

    #[test]
    fn test_exec_command_must_target_container() {
        let mut cmd = exec("run", CommandGroupKind::Run, true);
        if let Some(e) = cmd.exec.as_mut() {
            e.component = "ghost".to_string();
        }
        let df = devfile(vec![cmd]);
        let err = validate_and_get_push_commands(&df, None, None).unwrap_err();
        assert!(err.to_string().contains("invalid container component"));
    }

    #[test]
    fn test_cyclic_composite_is_rejected() {
        let composite = DevfileCommand {
            id: "loop".to_string(),
            exec: None,
            composite: Some(CompositeCommand {
                commands: vec!["loop".to_string()],
                parallel: false,
                group: Some(CommandGroup {
                    kind: CommandGroupKind::Build,
                    is_default: true,
                }),
            }),
        };
        let df = devfile(vec![composite, exec("run", CommandGroupKind::Run, true)]);
        let err = validate_and_get_push_commands(&df, None, None).unwrap_err();
        assert!(err.to_string().contains("references itself"));
    }

    #[test]
    fn test_debug_and_test_commands_are_required_when_asked() {
        let df = devfile(vec![exec("run", CommandGroupKind::Run, true)]);
        assert!(validate_and_get_debug_command(&df, None).is_err());
        assert!(validate_and_get_test_command(&df, None).is_err());

        let df = devfile(vec![exec("dbg", CommandGroupKind::Debug, false)]);
        assert_eq!(validate_and_get_debug_command(&df, None).unwrap().id, "dbg");
    }

    #[test]
    fn test_active_run_prefers_debug_in_debug_mode() {
        let cmds = PushCommands {
            build: None,
            run: exec("run", CommandGroupKind::Run, true),
            debug: Some(exec("dbg", CommandGroupKind::Debug, true)),
        };
        assert_eq!(cmds.active_run(false).id, "run");
        assert_eq!(cmds.active_run(true).id, "dbg");
    }

    #[test]
    fn test_resource_name_validation() {
        assert!(validate_resource_name("component name", "nodejs-app").is_ok());
        assert!(validate_resource_name("component name", "a1").is_ok());
        assert!(validate_resource_name("component name", "NodeJS").is_err());
        assert!(validate_resource_name("component name", "-bad").is_err());
        assert!(validate_resource_name("component name", "bad-").is_err());
        assert!(validate_resource_name("component name", "").is_err());
        assert!(validate_resource_name("component namespace", &"a".repeat(64)).is_err());
    }
}

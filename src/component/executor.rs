//! Devfile command execution inside the component pod

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::labels::SUPERVISORD_BINARY_PATH;
use super::supervisor::program_for;
use crate::cluster::conditions::{is_pod_running, pod_phase};
use crate::cluster::{CommandRunner, ExecOutput, ExecRequest};
use crate::devfile::{Devfile, DevfileCommand, ExecCommand, LifecycleEvent, PushCommands};
use crate::error::{Error, Result};

/// `export K="V" && cd <dir> && <command line>`
pub fn shell_command_line(exec: &ExecCommand) -> String {
    let mut parts: Vec<String> = exec
        .env
        .iter()
        .map(|e| format!("export {}=\"{}\"", e.name, e.value.replace('"', "\\\"")))
        .collect();
    if let Some(dir) = exec.working_dir.as_ref().filter(|d| !d.is_empty()) {
        parts.push(format!("cd {dir}"));
    }
    parts.push(exec.command_line.clone());
    parts.join(" && ")
}

pub fn shell_argv(exec: &ExecCommand) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        shell_command_line(exec),
    ]
}

/// `supervisord ctl <args..>`
pub fn supervisor_ctl(args: &[&str]) -> Vec<String> {
    let mut argv = vec![SUPERVISORD_BINARY_PATH.to_string(), "ctl".to_string()];
    argv.extend(args.iter().map(|a| a.to_string()));
    argv
}

/// Fail unless the pod is in the `Running` phase
pub fn ensure_running(component: &str, pod: &Pod) -> Result<()> {
    if is_pod_running(pod) {
        Ok(())
    } else {
        Err(Error::PodNotRunning {
            component: component.to_string(),
            phase: pod_phase(pod).to_string(),
        })
    }
}

/// Runs devfile commands in the containers of one pod
pub struct CommandExecutor<'a> {
    runner: &'a dyn CommandRunner,
    devfile: &'a Devfile,
    pod: String,
    show: bool,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, devfile: &'a Devfile, pod: &Pod, show: bool) -> Self {
        Self {
            runner,
            devfile,
            pod: pod.name_any(),
            show,
        }
    }

    pub fn pod_name(&self) -> &str {
        &self.pod
    }

    /// Run an argv in a container, surfacing transport failures and non-zero
    /// exits as a failure of command `id`.
    pub async fn run_in_container(
        &self,
        id: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let output = self
            .runner
            .exec(ExecRequest {
                pod: self.pod.clone(),
                container: container.to_string(),
                command,
                stdin: None,
                tty: false,
                show: self.show,
            })
            .await
            .map_err(|e| Error::CommandExecution {
                id: id.to_string(),
                message: e.to_string(),
            })?;

        if !output.success {
            let message = output
                .message
                .clone()
                .or_else(|| output.stderr.lines().last().map(str::to_string))
                .unwrap_or_else(|| "command exited with a non-zero status".to_string());
            return Err(Error::CommandExecution {
                id: id.to_string(),
                message,
            });
        }
        Ok(output)
    }

    /// Execute an exec command, or each step of a composite command in order.
    #[instrument(skip(self, command), fields(id = %command.id, pod = %self.pod))]
    pub async fn execute(&self, command: &DevfileCommand) -> Result<()> {
        let mut steps: Vec<&DevfileCommand> = Vec::new();
        self.flatten(command, &mut steps, 0)?;

        for step in steps {
            if let Some(exec) = step.exec.as_ref() {
                info!("Executing {} command \"{}\"", kind_label(step), exec.command_line);
                self.run_in_container(&step.id, &exec.component, shell_argv(exec))
                    .await?;
            }
        }
        Ok(())
    }

    fn flatten<'c>(
        &'c self,
        command: &'c DevfileCommand,
        steps: &mut Vec<&'c DevfileCommand>,
        depth: usize,
    ) -> Result<()>
    where
        'a: 'c,
    {
        if depth > self.devfile.commands.len() {
            return Err(Error::ValidationError(format!(
                "composite command \"{}\" is cyclic",
                command.id
            )));
        }
        match (&command.exec, &command.composite) {
            (Some(_), _) => steps.push(command),
            (None, Some(composite)) => {
                if composite.parallel {
                    debug!(
                        "composite command \"{}\" is parallel, running its steps in order",
                        command.id
                    );
                }
                for id in &composite.commands {
                    let sub = self.devfile.command(id).ok_or_else(|| {
                        Error::ValidationError(format!(
                            "the command \"{id}\" is not found in the devfile"
                        ))
                    })?;
                    self.flatten(sub, steps, depth + 1)?;
                }
            }
            (None, None) => {
                return Err(Error::ValidationError(format!(
                    "the command \"{}\" must be an exec or a composite command",
                    command.id
                )))
            }
        }
        Ok(())
    }

    /// Run the commands bound to a lifecycle event
    pub async fn execute_event(&self, event: LifecycleEvent, ids: &[String]) -> Result<()> {
        info!("Executing {} event commands", event);
        for id in ids {
            let command = self.devfile.command(id).ok_or_else(|| {
                Error::ValidationError(format!(
                    "{event} event command \"{id}\" is not found in the devfile"
                ))
            })?;
            self.execute(command).await?;
        }
        Ok(())
    }

    /// Build, then (re)start the run or debug program under supervisord.
    ///
    /// A component that already existed in the same run mode restarts its
    /// program, unless the command hot-reloads and needs no restart.
    pub async fn execute_push_commands(
        &self,
        commands: &PushCommands,
        component_existed: bool,
        run_mode_changed: bool,
        debug: bool,
    ) -> Result<()> {
        if let Some(build) = commands.build.as_ref() {
            self.execute(build).await?;
        }

        let run = commands.active_run(debug);
        let exec = run.exec.as_ref().ok_or_else(|| {
            Error::ValidationError(format!(
                "the command \"{}\" must be an exec command to run under supervisord",
                run.id
            ))
        })?;
        let program = program_for(run);

        if component_existed && !run_mode_changed {
            if exec.hot_reload_capable {
                info!(
                    "Command \"{}\" is hot reload capable, not restarting {}",
                    run.id, program
                );
                return Ok(());
            }
            info!("Restarting {} in container {}", program, exec.component);
            self.run_in_container(&run.id, &exec.component, supervisor_ctl(&["stop", "all"]))
                .await?;
        } else {
            info!("Starting {} in container {}", program, exec.component);
        }

        self.run_in_container(&run.id, &exec.component, supervisor_ctl(&["start", program]))
            .await?;
        Ok(())
    }
}

fn kind_label(command: &DevfileCommand) -> String {
    command
        .kind()
        .map(|k| k.to_string())
        .unwrap_or_else(|| "devfile".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devfile::EnvVarDef;
    use k8s_openapi::api::core::v1::PodStatus;

    #[test]
    fn test_shell_command_line_with_env_and_workdir() {
        let exec = ExecCommand {
            command_line: "npm install".to_string(),
            component: "runtime".to_string(),
            working_dir: Some("/projects".to_string()),
            env: vec![EnvVarDef {
                name: "NODE_ENV".to_string(),
                value: "dev".to_string(),
            }],
            ..Default::default()
        };
        assert_eq!(
            shell_command_line(&exec),
            "export NODE_ENV=\"dev\" && cd /projects && npm install"
        );
    }

    #[test]
    fn test_shell_command_line_bare() {
        let exec = ExecCommand {
            command_line: "make".to_string(),
            component: "runtime".to_string(),
            ..Default::default()
        };
        assert_eq!(shell_command_line(&exec), "make");
        assert_eq!(shell_argv(&exec), vec!["/bin/sh", "-c", "make"]);
    }

    #[test]
    fn test_supervisor_ctl_argv() {
        assert_eq!(
            supervisor_ctl(&["start", "devrun"]),
            vec![SUPERVISORD_BINARY_PATH, "ctl", "start", "devrun"]
        );
    }

    #[test]
    fn test_ensure_running_names_phase() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = ensure_running("nodejs", &pod).unwrap_err();
        assert!(err.to_string().contains("current status=Pending"));
    }
}

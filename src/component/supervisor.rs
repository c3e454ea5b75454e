//! Supervised program status checks
//!
//! The run and debug commands execute as supervisord programs inside the
//! component container. After (re)starting one, the adapter asks supervisord
//! for the program's state and shows the tail of the container log when it
//! is not running.

use std::io::Write;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::supervisor_ctl;
use crate::cluster::{CommandRunner, ExecRequest, LogRequest};
use crate::devfile::{CommandGroupKind, DevfileCommand};
use crate::error::{Error, Result};

/// Program running the devfile run command
pub const RUN_PROGRAM: &str = "devrun";
/// Program running the devfile debug command
pub const DEBUG_PROGRAM: &str = "debugrun";

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Supervisord program name for a run or debug command
pub fn program_for(command: &DevfileCommand) -> &'static str {
    match command.kind() {
        Some(CommandGroupKind::Debug) => DEBUG_PROGRAM,
        _ => RUN_PROGRAM,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramStatus {
    pub program: String,
    pub status: String,
}

impl ProgramStatus {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }
}

/// Parse `supervisord ctl status` output: one program per line, name and
/// state as the first two whitespace-separated fields.
pub fn parse_status(output: &str) -> Vec<ProgramStatus> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(program), Some(status)) => Some(ProgramStatus {
                    program: program.to_string(),
                    status: status.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Keep only the last `n` lines of `text`
pub fn last_lines(text: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}

pub struct SupervisorMonitor<'a> {
    runner: &'a dyn CommandRunner,
    component: &'a str,
    wait: Duration,
    tail_lines: usize,
    cancel: CancellationToken,
}

impl<'a> SupervisorMonitor<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        component: &'a str,
        wait: Duration,
        tail_lines: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            component,
            wait,
            tail_lines,
            cancel,
        }
    }

    /// Program states reported by supervisord in `container`. An exec failure
    /// yields an empty list so the caller reports the program as missing.
    pub async fn status_in_container(&self, pod: &str, container: &str) -> Vec<ProgramStatus> {
        let request = ExecRequest {
            pod: pod.to_string(),
            container: container.to_string(),
            command: supervisor_ctl(&["status"]),
            ..Default::default()
        };
        match self.runner.exec(request).await {
            Ok(output) => parse_status(&output.stdout),
            Err(e) => {
                debug!("unable to query supervisord status in {}: {}", container, e);
                Vec::new()
            }
        }
    }

    /// Confirm the program of `command` is running.
    ///
    /// Polls with a doubling backoff until the program reports running or the
    /// wait budget is spent. A program that exists but is not running only
    /// produces a warning and the log tail on `err_out`; a program supervisord
    /// does not know about is an error.
    pub async fn check_status(
        &self,
        pod: &str,
        command: &DevfileCommand,
        err_out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let program = program_for(command);
        let container = command.component().ok_or_else(|| {
            Error::ValidationError(format!(
                "the command \"{}\" does not target a container",
                command.id
            ))
        })?;

        let deadline = Instant::now() + self.wait;
        let mut delay = INITIAL_BACKOFF;
        let last = loop {
            let statuses = self.status_in_container(pod, container).await;
            let entry = statuses
                .into_iter()
                .find(|s| s.program.eq_ignore_ascii_case(program));

            if entry.as_ref().is_some_and(ProgramStatus::is_running) {
                debug!("{} is running in {}", program, container);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                break entry;
            }
            let pause = delay.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
            delay *= 2;
        };

        let Some(entry) = last else {
            return Err(Error::SupervisorProgramMissing(program.to_string()));
        };

        warn!(
            "devfile command \"{}\" exited with error status within {}ms ({} is {})",
            command.id,
            self.wait.as_millis(),
            entry.program,
            entry.status
        );
        info!("Last {} lines of the component's log:", self.tail_lines);
        self.write_log_tail(pod, container, err_out).await?;
        info!(
            "To get the full log output, run 'devpush log' for component {}",
            self.component
        );
        Ok(())
    }

    async fn write_log_tail(
        &self,
        pod: &str,
        container: &str,
        err_out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        self.runner
            .logs(
                LogRequest {
                    pod: pod.to_string(),
                    container: container.to_string(),
                    follow: false,
                    tail_lines: Some(self.tail_lines as i64),
                },
                &mut buf,
            )
            .await?;

        let text = String::from_utf8_lossy(&buf);
        for line in last_lines(&text, self.tail_lines) {
            writeln!(err_out, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devfile::{CommandGroup, ExecCommand};

    fn command(kind: CommandGroupKind) -> DevfileCommand {
        DevfileCommand {
            id: "cmd".to_string(),
            exec: Some(ExecCommand {
                command_line: "npm start".to_string(),
                component: "runtime".to_string(),
                group: Some(CommandGroup {
                    kind,
                    is_default: true,
                }),
                ..Default::default()
            }),
            composite: None,
        }
    }

    #[test]
    fn test_program_mapping() {
        assert_eq!(program_for(&command(CommandGroupKind::Run)), RUN_PROGRAM);
        assert_eq!(program_for(&command(CommandGroupKind::Debug)), DEBUG_PROGRAM);
    }

    #[test]
    fn test_parse_status_lines() {
        let out = "devrun                           Running   pid 42, uptime 0:00:03\n\
                   debugrun                         Stopped   Not started\n\
                   \n";
        let statuses = parse_status(out);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].program, "devrun");
        assert!(statuses[0].is_running());
        assert_eq!(statuses[1].status, "Stopped");
        assert!(!statuses[1].is_running());
    }

    #[test]
    fn test_running_match_ignores_case() {
        let status = ProgramStatus {
            program: "DEVRUN".to_string(),
            status: "RUNNING".to_string(),
        };
        assert!(status.is_running());
    }

    #[test]
    fn test_last_lines_bound() {
        let text: String = (1..=30).map(|i| format!("line {i}\n")).collect();
        let tail = last_lines(&text, 20);
        assert_eq!(tail.len(), 20);
        assert_eq!(tail[0], "line 11");
        assert_eq!(tail[19], "line 30");

        assert_eq!(last_lines("a\nb\n", 20), vec!["a", "b"]);
    }
}

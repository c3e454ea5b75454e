//! Component adapter: the push flow and the standalone component operations
//!
//! A push runs these steps in order, stopping at the first error:
//!
//! 1. validate names and resolve the commands ([`PushContext::new`])
//! 2. record the running pod of an existing component
//! 3. create or update the workload ([`ResourceReconciler`])
//! 4. wait for the rollout and for a running pod
//! 5. hand unowned claims to the deployment
//! 6. compare the pod with the one recorded in step 2
//! 7. locate the container receiving the sources
//! 8. sync the sources, which tells whether commands must run again
//! 9. run `postStart` events on first creation
//! 10. build, then run or debug under supervisord, when required
//! 11. confirm the supervised program is running

use std::io::Write;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::context::{PushContext, PushParameters};
use super::executor::{ensure_running, CommandExecutor};
use super::labels::selector;
use super::probe::{sync_target, PodCache};
use super::reconciler::{reconcile_volume_ownership, ResourceReconciler};
use super::supervisor::SupervisorMonitor;
use crate::cluster::{CommandRunner, LogRequest, RuntimeProbe, WorkloadStore};
use crate::config::{EnvInfo, RunMode, Settings};
use crate::devfile::{
    validate_and_get_debug_command, validate_and_get_push_commands,
    validate_and_get_test_command, Devfile, DevfileCommand, LifecycleEvent,
};
use crate::error::{Error, Result};
use crate::sync::{SyncParameters, Syncer};

/// What a push did
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushOutcome {
    pub component_existed: bool,
    pub pod_changed: bool,
    /// Build and run commands were executed
    pub executed: bool,
    /// Mode to persist for the next push
    pub run_mode: RunMode,
}

pub type ErrorSink = Arc<Mutex<dyn Write + Send>>;

pub struct ComponentAdapter {
    store: Arc<dyn WorkloadStore>,
    probe: Arc<dyn RuntimeProbe>,
    runner: Arc<dyn CommandRunner>,
    syncer: Arc<dyn Syncer>,
    devfile: Devfile,
    component_name: String,
    app: String,
    settings: Settings,
    cancel: CancellationToken,
    err_out: ErrorSink,
}

impl ComponentAdapter {
    /// Adapter over a backend implementing all three cluster interfaces
    pub fn new<C>(
        cluster: Arc<C>,
        syncer: Arc<dyn Syncer>,
        devfile: Devfile,
        component_name: impl Into<String>,
        app: impl Into<String>,
        settings: Settings,
    ) -> Self
    where
        C: WorkloadStore + RuntimeProbe + CommandRunner + 'static,
    {
        Self {
            store: cluster.clone(),
            probe: cluster.clone(),
            runner: cluster,
            syncer,
            devfile,
            component_name: component_name.into(),
            app: app.into(),
            settings,
            cancel: CancellationToken::new(),
            err_out: Arc::new(Mutex::new(std::io::stderr())),
        }
    }

    /// Cancel pending supervisor polls when `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Where the log tail of a failing program is written
    pub fn with_err_out(mut self, err_out: ErrorSink) -> Self {
        self.err_out = err_out;
        self
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    fn selector(&self) -> String {
        selector(&self.component_name)
    }

    #[instrument(skip(self, params, env), fields(component = %self.component_name))]
    pub async fn push(&self, params: PushParameters, env: &EnvInfo) -> Result<PushOutcome> {
        info!("Validating the devfile");
        let ctx = PushContext::new(&self.devfile, &self.component_name, &self.app, params, env)?;
        let probe = self.probe.as_ref();
        let mut pods = PodCache::new(self.selector());

        let component_existed = self.probe.deployment_exists(&ctx.component).await?;
        let baseline = if component_existed {
            Some(pods.get(probe).await?.name_any())
        } else {
            None
        };

        info!("Creating Kubernetes resources for component {}", ctx.component);
        ResourceReconciler::new(self.store.as_ref(), &self.settings)
            .create_or_update(&ctx, &self.devfile, component_existed)
            .await?;

        info!("Waiting for component {} to start", ctx.component);
        let deployment = self.probe.wait_for_rollout(&ctx.component).await?;
        let pod = pods.refresh(probe).await?.clone();
        reconcile_volume_ownership(self.store.as_ref(), &self.selector(), &deployment).await?;

        let pod_name = pod.name_any();
        let pod_changed = component_existed && baseline.as_deref() != Some(pod_name.as_str());
        if pod_changed {
            info!("Component {} now runs in a new pod {}", ctx.component, pod_name);
        }

        let target = sync_target(&pod)?;
        info!("Syncing to component {}", ctx.component);
        let sync_params = SyncParameters {
            pod: pod_name.clone(),
            container: target.container,
            sync_folder: target.sync_folder,
            project_dir: ctx.project_dir.clone(),
            component_exists: component_existed,
            pod_changed,
            force_build: ctx.force_build,
        };
        let files_changed = self
            .syncer
            .sync_files(self.runner.as_ref(), &sync_params)
            .await?;

        let executor = CommandExecutor::new(self.runner.as_ref(), &self.devfile, &pod, ctx.show);
        if !component_existed && !self.devfile.events.post_start.is_empty() {
            executor
                .execute_event(LifecycleEvent::PostStart, &self.devfile.events.post_start)
                .await?;
        }

        let run_mode_changed = ctx.run_mode_changed();
        // A new component, a replaced pod or a forced build always executes
        let executed = files_changed || sync_params.full_sync() || run_mode_changed;
        if executed {
            info!("Executing devfile commands for component {}", ctx.component);
            executor
                .execute_push_commands(
                    &ctx.commands,
                    component_existed,
                    run_mode_changed,
                    ctx.debug,
                )
                .await?;
            self.check_supervisor_status(&pod_name, ctx.commands.active_run(ctx.debug))
                .await?;
        } else {
            info!("No file changes detected, skipping build. Use the '-f' flag to force the build.");
        }

        Ok(PushOutcome {
            component_existed,
            pod_changed,
            executed,
            run_mode: ctx.run_mode,
        })
    }

    /// Confirm the program of `command` runs in `pod`, writing the log tail to
    /// the error sink when it does not.
    pub async fn check_supervisor_status(&self, pod: &str, command: &DevfileCommand) -> Result<()> {
        let monitor = SupervisorMonitor::new(
            self.runner.as_ref(),
            &self.component_name,
            self.settings.supervisor_wait(),
            self.settings.log_tail_lines,
            self.cancel.clone(),
        );
        let mut err_out = self.err_out.lock().await;
        monitor.check_status(pod, command, &mut *err_out).await
    }

    pub async fn does_component_exist(&self) -> Result<bool> {
        self.probe.deployment_exists(&self.component_name).await
    }

    /// Delete the component's deployments; dependents follow through their
    /// owner references. `preStop` events run first.
    #[instrument(skip(self), fields(component = %self.component_name))]
    pub async fn delete(&self, show: bool) -> Result<()> {
        info!("Gathering information for component {}", self.component_name);
        let selector = self.selector();
        let pod = match self.probe.find_pod(&selector).await {
            Ok(pod) => pod,
            Err(e) if e.is_forbidden() || e.is_not_found() => {
                warn!("{}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let pre_stop = &self.devfile.events.pre_stop;
        if !pre_stop.is_empty() {
            ensure_running(&self.component_name, &pod)?;
            CommandExecutor::new(self.runner.as_ref(), &self.devfile, &pod, show)
                .execute_event(LifecycleEvent::PreStop, pre_stop)
                .await?;
        }

        info!("Deleting component {}", self.component_name);
        self.store
            .delete_deployments(&selector)
            .await
            .map_err(Error::mutation(
                format!("deployments of {}", self.component_name),
                "delete",
            ))?;
        info!("Successfully deleted component");
        Ok(())
    }

    /// Run the named test command, or the default one
    #[instrument(skip(self), fields(component = %self.component_name))]
    pub async fn test(&self, test_command: Option<&str>, show: bool) -> Result<()> {
        let pod = self.running_pod().await?;
        let command = validate_and_get_test_command(&self.devfile, test_command)?;
        info!("Executing test command \"{}\"", command.id);
        CommandExecutor::new(self.runner.as_ref(), &self.devfile, &pod, show)
            .execute(&command)
            .await
    }

    /// Run an arbitrary command in the run command's container
    pub async fn exec(&self, command: Vec<String>) -> Result<()> {
        if !self.does_component_exist().await? {
            return Err(Error::NotFound {
                kind: "component",
                name: self.component_name.clone(),
            });
        }
        let pod = self.running_pod().await?;
        let commands = validate_and_get_push_commands(&self.devfile, None, None)?;
        let container = command_container(&commands.run)?;

        let id = command.join(" ");
        CommandExecutor::new(self.runner.as_ref(), &self.devfile, &pod, true)
            .run_in_container(&id, container, command)
            .await?;
        Ok(())
    }

    /// Write the log of the run (or debug) command's container into `sink`
    pub async fn log(
        &self,
        follow: bool,
        debug: bool,
        sink: &mut (dyn Write + Send),
    ) -> Result<()> {
        let pod = self.running_pod().await?;
        let command = if debug {
            validate_and_get_debug_command(&self.devfile, None)?
        } else {
            validate_and_get_push_commands(&self.devfile, None, None)?.run
        };
        let container = command_container(&command)?;

        self.runner
            .logs(
                LogRequest {
                    pod: pod.name_any(),
                    container: container.to_string(),
                    follow,
                    tail_lines: None,
                },
                sink,
            )
            .await
    }

    async fn running_pod(&self) -> Result<Pod> {
        let pod = self.probe.find_pod(&self.selector()).await?;
        ensure_running(&self.component_name, &pod)?;
        Ok(pod)
    }
}

fn command_container(command: &DevfileCommand) -> Result<&str> {
    command.component().ok_or_else(|| {
        Error::ValidationError(format!(
            "the command \"{}\" does not target a container",
            command.id
        ))
    })
}

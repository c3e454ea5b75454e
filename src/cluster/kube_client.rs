//! `kube`-backed implementation of the cluster capability traits

use std::io::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{
    Api, ApiResource, AttachParams, DeleteParams, DynamicObject, GroupVersionKind, ListParams,
    LogParams, Patch, PatchParams, PostParams,
};
use kube::runtime::wait::await_condition;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWriteExt, BufReader};
use tracing::{debug, info, instrument, warn};

use super::conditions::{is_pod_running, pod_phase, rollout_complete};
use super::{CommandRunner, ExecOutput, ExecRequest, LogRequest, RuntimeProbe, WorkloadStore};
use crate::error::{Error, Result};

pub const SERVICE_BINDING_GROUP: &str = "binding.operators.coreos.com";
pub const SERVICE_BINDING_VERSION: &str = "v1alpha1";
pub const SERVICE_BINDING_KIND: &str = "ServiceBinding";
pub const SERVICE_BINDING_RESOURCE: &str = "servicebindings";

/// Cluster access scoped to one namespace
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
    field_manager: String,
    pod_timeout: Duration,
    rollout_timeout: Duration,
}

impl KubeCluster {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        field_manager: impl Into<String>,
        pod_timeout: Duration,
        rollout_timeout: Duration,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            field_manager: field_manager.into(),
            pod_timeout,
            rollout_timeout,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Server-side apply under one field manager, so fields dropped from the
    /// devfile are pruned on the next apply.
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let api: Api<Deployment> = self.api();
        let name = deployment.name_any();
        let patch = Patch::Apply(deployment);
        Ok(api.patch(&name, &self.apply_params(), &patch).await?)
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }

    /// Warning events recorded against the given pods, newest last
    async fn pod_warnings(&self, pods: &[String]) -> Vec<String> {
        let events: Api<Event> = self.api();
        let list = match events.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                debug!("unable to list events: {}", e);
                return Vec::new();
            }
        };
        list.items
            .into_iter()
            .filter(|ev| ev.type_.as_deref() == Some("Warning"))
            .filter(|ev| {
                ev.involved_object
                    .name
                    .as_ref()
                    .map(|n| pods.contains(n))
                    .unwrap_or(false)
            })
            .filter_map(|ev| {
                let reason = ev.reason.unwrap_or_default();
                ev.message.map(|m| format!("{reason}: {m}"))
            })
            .collect()
    }
}

/// Map API status codes onto the crate's not-found / forbidden variants
fn classify(err: kube::Error, kind: &'static str, name: &str) -> Error {
    match err {
        kube::Error::Api(ref e) if e.code == 404 => Error::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ref e) if e.code == 403 => Error::Forbidden(e.message.clone()),
        kube::Error::Api(ref e) if e.code == 409 => Error::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        other => Error::KubeError(other),
    }
}

#[async_trait]
impl WorkloadStore for KubeCluster {
    #[instrument(skip(self, deployment), fields(name = %deployment.name_any()))]
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        info!("Creating Deployment {}", deployment.name_any());
        self.apply_deployment(deployment).await
    }

    #[instrument(skip(self, deployment), fields(name = %deployment.name_any()))]
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        info!("Updating Deployment {}", deployment.name_any());
        self.apply_deployment(deployment).await
    }

    async fn delete_deployments(&self, selector: &str) -> Result<()> {
        let api: Api<Deployment> = self.api();
        let lp = ListParams::default().labels(selector);
        api.delete_collection(&DeleteParams::background(), &lp).await?;
        info!("Deleted deployments matching {}", selector);
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = self.api();
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let api: Api<Service> = self.api();
        info!("Creating Service {}", service.name_any());
        Ok(api.create(&PostParams::default(), service).await?)
    }

    async fn update_service(&self, service: &Service) -> Result<Service> {
        let api: Api<Service> = self.api();
        let name = service.name_any();
        info!("Updating Service {}", name);
        Ok(api.replace(&name, &PostParams::default(), service).await?)
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        let api: Api<Service> = self.api();
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => info!("Deleted Service {}", name),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!("Service {} not found, already deleted", name);
            }
            Err(e) => return Err(Error::KubeError(e)),
        }
        Ok(())
    }

    async fn list_pvcs(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = self.api();
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = self.api();
        let name = pvc.name_any();
        info!("Creating PVC {}", name);
        api.create(&PostParams::default(), pvc)
            .await
            .map_err(|e| classify(e, "persistentvolumeclaim", &name))
    }

    async fn add_pvc_owner(&self, name: &str, owner: &OwnerReference) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.api();
        let mut pvc = api.get(name).await?;
        let mut owners = pvc.metadata.owner_references.take().unwrap_or_default();
        owners.push(owner.clone());
        let patch = json!({
            "metadata": {
                "ownerReferences": owners
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Set owner {} on PVC {}", owner.name, name);
        Ok(())
    }

    async fn bound_secret(&self, binding: &str) -> Result<Option<String>> {
        let gvk = GroupVersionKind::gvk(
            SERVICE_BINDING_GROUP,
            SERVICE_BINDING_VERSION,
            SERVICE_BINDING_KIND,
        );
        let resource = ApiResource::from_gvk_with_plural(&gvk, SERVICE_BINDING_RESOURCE);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &resource);
        let obj = api
            .get(binding)
            .await
            .map_err(|e| classify(e, "ServiceBinding", binding))?;
        Ok(obj
            .data
            .get("status")
            .and_then(|s| s.get("secret"))
            .and_then(|s| s.as_str())
            .map(str::to_string))
    }
}

#[async_trait]
impl RuntimeProbe for KubeCluster {
    async fn deployment_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Deployment> = self.api();
        match api.get(name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(classify(e, "deployment", name)),
        }
    }

    async fn find_pod(&self, selector: &str) -> Result<Pod> {
        let api: Api<Pod> = self.api();
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| classify(e, "pod", selector))?;
        list.items.into_iter().next().ok_or_else(|| Error::NotFound {
            kind: "pod",
            name: selector.to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn wait_for_running_pod(&self, selector: &str) -> Result<Pod> {
        let api: Api<Pod> = self.api();
        info!("Waiting for component to start");

        let stream = watcher(api, watcher::Config::default().labels(selector))
            .default_backoff()
            .applied_objects();
        let wait = async {
            let mut stream = std::pin::pin!(stream);
            while let Some(pod) = stream
                .try_next()
                .await
                .map_err(|e| Error::Watch(format!("pods {selector}: {e}")))?
            {
                debug!("pod {} is {}", pod.name_any(), pod_phase(&pod));
                if is_pod_running(&pod) {
                    return Ok(pod);
                }
            }
            Err::<Pod, Error>(Error::NotFound {
                kind: "pod",
                name: selector.to_string(),
            })
        };

        match tokio::time::timeout(self.pod_timeout, wait).await {
            Ok(res) => res,
            Err(_) => {
                let pods: Api<Pod> = self.api();
                let names: Vec<String> = pods
                    .list(&ListParams::default().labels(selector))
                    .await
                    .map(|l| l.items.iter().map(|p| p.name_any()).collect())
                    .unwrap_or_default();
                let warnings = self.pod_warnings(&names).await;
                let mut msg = format!(
                    "after {}s waiting for pod {selector} to be running",
                    self.pod_timeout.as_secs()
                );
                if !warnings.is_empty() {
                    msg.push_str(&format!(": {}", warnings.join("; ")));
                }
                Err(Error::Timeout(msg))
            }
        }
    }

    #[instrument(skip(self))]
    async fn wait_for_rollout(&self, name: &str) -> Result<Deployment> {
        let api: Api<Deployment> = self.api();
        let cond = await_condition(api, name, rollout_complete());
        match tokio::time::timeout(self.rollout_timeout, cond).await {
            Ok(Ok(Some(deployment))) => Ok(deployment),
            Ok(Ok(None)) => Err(Error::NotFound {
                kind: "deployment",
                name: name.to_string(),
            }),
            Ok(Err(e)) => Err(Error::Watch(format!("deployment {name} rollout: {e}"))),
            Err(_) => Err(Error::Timeout(format!(
                "after {}s waiting for deployment {name} to roll out",
                self.rollout_timeout.as_secs()
            ))),
        }
    }
}

/// Drain a reader into a string, echoing each line when `show` is set
async fn collect_stream<R>(reader: Option<R>, show: bool, to_stderr: bool) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let mut lines = BufReader::new(reader).lines();
    let mut out = String::new();
    while let Some(line) = lines.next_line().await? {
        if show {
            if to_stderr {
                eprintln!("{line}");
            } else {
                println!("{line}");
            }
        }
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

#[async_trait]
impl CommandRunner for KubeCluster {
    #[instrument(skip(self, request), fields(pod = %request.pod, container = %request.container))]
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let api: Api<Pod> = self.api();
        let params = AttachParams::default()
            .container(request.container.clone())
            .stdin(request.stdin.is_some())
            .stdout(true)
            .stderr(!request.tty)
            .tty(request.tty);

        debug!("exec {:?}", request.command);
        let mut attached = api
            .exec(&request.pod, request.command.clone(), &params)
            .await?;

        if let Some(input) = request.stdin.as_ref() {
            if let Some(mut writer) = attached.stdin() {
                writer.write_all(input).await?;
                writer.shutdown().await?;
            }
        }

        let status = attached.take_status();
        let (stdout, stderr) = tokio::try_join!(
            collect_stream(attached.stdout(), request.show, false),
            collect_stream(attached.stderr(), request.show, true),
        )?;

        let status = match status {
            Some(fut) => fut.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("exec transport failed: {e}"))))?;

        let (success, message) = match status {
            Some(s) if s.status.as_deref() == Some("Success") => (true, None),
            Some(s) => (false, s.message.or(s.reason)),
            None => (true, None),
        };

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
            message,
        })
    }

    async fn logs(
        &self,
        request: LogRequest,
        sink: &mut (dyn std::io::Write + Send),
    ) -> Result<()> {
        let api: Api<Pod> = self.api();
        let params = LogParams {
            container: Some(request.container.clone()),
            follow: request.follow,
            tail_lines: request.tail_lines,
            ..Default::default()
        };

        if !request.follow {
            let text = api.logs(&request.pod, &params).await?;
            sink.write_all(text.as_bytes())?;
            return Ok(());
        }

        let lines = api.log_stream(&request.pod, &params).await?.lines();
        let mut lines = std::pin::pin!(lines);
        while let Some(line) = lines.next().await {
            let line = line?;
            writeln!(sink, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from the api server"),
            reason: reason.to_string(),
            code,
        })
    }

    #[tokio::test]
    async fn test_deployment_writes_share_one_apply_manager() {
        let config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        let cluster = KubeCluster::new(
            client,
            "dev",
            "devpush",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let params = cluster.apply_params();
        assert_eq!(params.field_manager.as_deref(), Some("devpush"));
        assert!(params.force);
    }

    #[test]
    fn test_classify_maps_status_codes() {
        assert!(classify(api_error(404, "NotFound"), "pod", "p").is_not_found());
        assert!(classify(api_error(403, "Forbidden"), "pod", "p").is_forbidden());
        assert!(matches!(
            classify(api_error(409, "AlreadyExists"), "persistentvolumeclaim", "nodejs-cache"),
            Error::AlreadyExists { name, .. } if name == "nodejs-cache"
        ));
        assert!(matches!(
            classify(api_error(500, "InternalError"), "pod", "p"),
            Error::KubeError(_)
        ));
    }
}

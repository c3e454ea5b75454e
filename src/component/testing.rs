//! In-memory cluster and syncer used by the component tests

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodStatus, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::cluster::{
    CommandRunner, ExecOutput, ExecRequest, LogRequest, RuntimeProbe, WorkloadStore,
};
use crate::devfile::Devfile;
use crate::error::{Error, Result};
use crate::sync::{SyncParameters, Syncer};

pub const NODEJS_DEVFILE: &str = r#"
schemaVersion: 2.0.0
metadata:
  name: nodejs
components:
  - name: runtime
    container:
      image: node:18
      memoryLimit: 1024Mi
      endpoints:
        - name: http-3000
          targetPort: 3000
      volumeMounts:
        - name: cache
          path: /cache
  - name: tools
    container:
      image: busybox
      mountSources: false
  - name: cache
    volume:
      size: 2Gi
commands:
  - id: install
    exec:
      component: runtime
      commandLine: npm install
      workingDir: /projects
      group:
        kind: build
        isDefault: true
  - id: run
    exec:
      component: runtime
      commandLine: npm start
      workingDir: /projects
      group:
        kind: run
        isDefault: true
  - id: debug
    exec:
      component: runtime
      commandLine: npm run debug
      workingDir: /projects
      group:
        kind: debug
        isDefault: true
  - id: test
    exec:
      component: runtime
      commandLine: npm test
      group:
        kind: test
        isDefault: true
  - id: seed
    exec:
      component: runtime
      commandLine: ./seed.sh
  - id: cleanup
    exec:
      component: runtime
      commandLine: ./cleanup.sh
events:
  postStart:
    - seed
  preStop:
    - cleanup
"#;

pub fn nodejs_devfile() -> Devfile {
    Devfile::from_yaml(NODEJS_DEVFILE).unwrap()
}

#[derive(Default)]
pub struct ClusterState {
    pub deployments: BTreeMap<String, Deployment>,
    pub services: BTreeMap<String, Service>,
    pub pvcs: BTreeMap<String, PersistentVolumeClaim>,
    /// ServiceBinding name to published secret
    pub bindings: BTreeMap<String, String>,
    /// Name of the pod currently backing the deployment
    pub pod_name: Option<String>,
    pub pod_phase: String,
    /// Pod names taken, one per rollout, to simulate replaced pods
    pub rollout_pods: VecDeque<String>,
    /// Output of `supervisord ctl status`
    pub supervisor_status: String,
    pub container_log: String,
    pub forbidden: bool,
    /// Mutating and exec calls, in order
    pub ops: Vec<String>,
    pub execs: Vec<ExecRequest>,
    pub log_requests: Vec<LogRequest>,
}

pub struct FakeCluster {
    pub state: Mutex<ClusterState>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                pod_phase: "Running".to_string(),
                supervisor_status: "devrun    RUNNING   pid 12, uptime 0:00:01\n\
                                    debugrun  STOPPED   Not started\n"
                    .to_string(),
                ..Default::default()
            }),
        }
    }
}

impl FakeCluster {
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        let mut state = self.state.lock().unwrap();
        state.ops.clear();
        state.execs.clear();
    }

    pub fn creations(&self) -> usize {
        self.ops().iter().filter(|op| op.starts_with("create ")).count()
    }

    pub fn exec_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .execs
            .iter()
            .map(|e| e.command.join(" "))
            .collect()
    }

    pub fn with_state(&self, f: impl FnOnce(&mut ClusterState)) {
        f(&mut self.state.lock().unwrap());
    }

    fn pod(state: &ClusterState, name: &str) -> Option<Pod> {
        let pod_name = state.pod_name.clone()?;
        let deployment = state.deployments.get(name);
        let template = deployment.and_then(|d| d.spec.as_ref()).map(|s| s.template.clone());
        Some(Pod {
            metadata: ObjectMeta {
                name: Some(pod_name),
                labels: template.as_ref().and_then(|t| t.metadata.as_ref()?.labels.clone()),
                ..Default::default()
            },
            spec: template.and_then(|t| t.spec),
            status: Some(PodStatus {
                phase: Some(state.pod_phase.clone()),
                ..Default::default()
            }),
        })
    }

    fn component_of(selector: &str) -> &str {
        selector.split_once('=').map(|(_, v)| v).unwrap_or(selector)
    }
}

#[async_trait]
impl WorkloadStore for FakeCluster {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let mut state = self.state.lock().unwrap();
        let name = deployment.name_any();
        let mut stored = deployment.clone();
        stored.metadata.uid = Some(format!("uid-{name}"));
        stored.metadata.resource_version = Some("1".to_string());
        state.ops.push(format!("create deployment {name}"));
        state.deployments.insert(name.clone(), stored.clone());
        if state.pod_name.is_none() {
            state.pod_name = Some(format!("{name}-pod-1"));
        }
        Ok(stored)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let mut state = self.state.lock().unwrap();
        let name = deployment.name_any();
        let uid = state
            .deployments
            .get(&name)
            .and_then(|d| d.metadata.uid.clone())
            .ok_or_else(|| Error::NotFound {
                kind: "deployment",
                name: name.clone(),
            })?;
        let mut stored = deployment.clone();
        stored.metadata.uid = Some(uid);
        state.ops.push(format!("update deployment {name}"));
        state.deployments.insert(name, stored.clone());
        Ok(stored)
    }

    async fn delete_deployments(&self, selector: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let component = Self::component_of(selector).to_string();
        state.ops.push(format!("delete deployments {selector}"));
        state.deployments.remove(&component);
        state.pod_name = None;
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        Ok(self.state.lock().unwrap().services.get(name).cloned())
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let mut state = self.state.lock().unwrap();
        let name = service.name_any();
        let mut stored = service.clone();
        stored.metadata.resource_version = Some("1".to_string());
        if let Some(spec) = stored.spec.as_mut() {
            spec.cluster_ip = Some("10.0.0.12".to_string());
        }
        state.ops.push(format!("create service {name}"));
        state.services.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update_service(&self, service: &Service) -> Result<Service> {
        let mut state = self.state.lock().unwrap();
        let name = service.name_any();
        state.ops.push(format!("update service {name}"));
        state.services.insert(name, service.clone());
        Ok(service.clone())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("delete service {name}"));
        state.services.remove(name);
        Ok(())
    }

    async fn list_pvcs(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let component = Self::component_of(selector);
        Ok(self
            .state
            .lock()
            .unwrap()
            .pvcs
            .values()
            .filter(|pvc| pvc.labels().get("component").map(String::as_str) == Some(component))
            .cloned()
            .collect())
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let mut state = self.state.lock().unwrap();
        let name = pvc.name_any();
        if state.pvcs.contains_key(&name) {
            return Err(Error::AlreadyExists {
                kind: "persistentvolumeclaim",
                name,
            });
        }
        state.ops.push(format!("create pvc {name}"));
        state.pvcs.insert(name, pvc.clone());
        Ok(pvc.clone())
    }

    async fn add_pvc_owner(&self, name: &str, owner: &OwnerReference) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("own pvc {name}"));
        let pvc = state.pvcs.get_mut(name).ok_or_else(|| Error::NotFound {
            kind: "persistentvolumeclaim",
            name: name.to_string(),
        })?;
        pvc.metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(owner.clone());
        Ok(())
    }

    async fn bound_secret(&self, binding: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().bindings.get(binding).cloned())
    }
}

#[async_trait]
impl RuntimeProbe for FakeCluster {
    async fn deployment_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().deployments.contains_key(name))
    }

    async fn find_pod(&self, selector: &str) -> Result<Pod> {
        let state = self.state.lock().unwrap();
        if state.forbidden {
            return Err(Error::Forbidden(format!("pods with {selector}")));
        }
        Self::pod(&state, Self::component_of(selector)).ok_or_else(|| Error::NotFound {
            kind: "pod",
            name: selector.to_string(),
        })
    }

    async fn wait_for_running_pod(&self, selector: &str) -> Result<Pod> {
        let state = self.state.lock().unwrap();
        match Self::pod(&state, Self::component_of(selector)) {
            Some(pod) if state.pod_phase == "Running" => Ok(pod),
            _ => Err(Error::Timeout(format!("waiting for a running pod of {selector}"))),
        }
    }

    async fn wait_for_rollout(&self, name: &str) -> Result<Deployment> {
        let mut state = self.state.lock().unwrap();
        if let Some(next) = state.rollout_pods.pop_front() {
            state.pod_name = Some(next);
        }
        state.deployments.get(name).cloned().ok_or_else(|| Error::NotFound {
            kind: "deployment",
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl CommandRunner for FakeCluster {
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        let line = request.command.join(" ");
        state.ops.push(format!("exec {line}"));
        state.execs.push(request);
        let stdout = if line.ends_with("ctl status") {
            state.supervisor_status.clone()
        } else {
            String::new()
        };
        Ok(ExecOutput {
            stdout,
            success: true,
            ..Default::default()
        })
    }

    async fn logs(
        &self,
        request: LogRequest,
        sink: &mut (dyn std::io::Write + Send),
    ) -> Result<()> {
        let log = {
            let mut state = self.state.lock().unwrap();
            state.log_requests.push(request);
            state.container_log.clone()
        };
        sink.write_all(log.as_bytes())?;
        Ok(())
    }
}

/// Syncer reporting a fixed change result
#[derive(Default)]
pub struct FakeSyncer {
    pub changes: Mutex<bool>,
    pub calls: Mutex<Vec<SyncParameters>>,
}

impl FakeSyncer {
    pub fn reporting(changes: bool) -> Self {
        Self {
            changes: Mutex::new(changes),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_changes(&self, changes: bool) {
        *self.changes.lock().unwrap() = changes;
    }

    pub fn last_call(&self) -> Option<SyncParameters> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Syncer for FakeSyncer {
    async fn sync_files(
        &self,
        _runner: &dyn CommandRunner,
        params: &SyncParameters,
    ) -> Result<bool> {
        self.calls.lock().unwrap().push(params.clone());
        Ok(*self.changes.lock().unwrap())
    }
}

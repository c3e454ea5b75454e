//! Cluster capability interfaces
//!
//! The component adapter talks to the cluster through three narrow traits so
//! alternate backends (and in-memory fakes in tests) can be substituted:
//!
//! - [`WorkloadStore`] - create/update/delete the workload resources
//! - [`RuntimeProbe`] - read workload and pod state, wait for readiness
//! - [`CommandRunner`] - exec into containers and read their logs
//!
//! [`kube_client::KubeCluster`] implements all three on top of `kube`.

pub mod conditions;
pub mod kube_client;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::error::Result;

pub use kube_client::KubeCluster;

#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    /// Update the deployment in place, keyed by its name
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    /// Delete every deployment matching the label selector
    async fn delete_deployments(&self, selector: &str) -> Result<()>;

    async fn get_service(&self, name: &str) -> Result<Option<Service>>;

    async fn create_service(&self, service: &Service) -> Result<Service>;

    async fn update_service(&self, service: &Service) -> Result<Service>;

    async fn delete_service(&self, name: &str) -> Result<()>;

    async fn list_pvcs(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>>;

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// Append `owner` to the claim's owner references
    async fn add_pvc_owner(&self, name: &str, owner: &OwnerReference) -> Result<()>;

    /// Secret name published by a ServiceBinding, `None` until it has one
    async fn bound_secret(&self, binding: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait RuntimeProbe: Send + Sync {
    async fn deployment_exists(&self, name: &str) -> Result<bool>;

    /// First pod matching the selector, whatever its phase
    async fn find_pod(&self, selector: &str) -> Result<Pod>;

    /// Block until a pod matching the selector is `Running`
    async fn wait_for_running_pod(&self, selector: &str) -> Result<Pod>;

    /// Block until the deployment's rollout completes
    async fn wait_for_rollout(&self, name: &str) -> Result<Deployment>;
}

/// An argv to run inside one container of a pod
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecRequest {
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub tty: bool,
    /// Stream output to the terminal while the command runs
    pub show: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    /// Failure reason reported by the exec transport
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogRequest {
    pub pod: String,
    pub container: String,
    pub follow: bool,
    pub tail_lines: Option<i64>,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput>;

    /// Write the container log into `sink`, following it when requested
    async fn logs(
        &self,
        request: LogRequest,
        sink: &mut (dyn std::io::Write + Send),
    ) -> Result<()>;
}

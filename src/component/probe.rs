//! Pass-scoped view of the component's runtime state

use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;
use tracing::debug;

use super::labels::ENV_PROJECTS_ROOT;
use crate::cluster::RuntimeProbe;
use crate::error::{Error, Result};

/// Running pod of the component, fetched on first use and kept until
/// invalidated. One cache lives for exactly one push.
#[derive(Debug, Default)]
pub struct PodCache {
    selector: String,
    pod: Option<Pod>,
}

impl PodCache {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            pod: None,
        }
    }

    /// Cached pod, or wait for a running one
    pub async fn get(&mut self, probe: &dyn RuntimeProbe) -> Result<&Pod> {
        if self.pod.is_none() {
            let pod = probe
                .wait_for_running_pod(&self.selector)
                .await
                .map_err(|e| match e {
                    Error::Timeout(msg) => Error::Timeout(format!(
                        "while waiting for pod {}: {msg}",
                        self.selector
                    )),
                    other => other,
                })?;
            debug!("cached pod {} for {}", pod.name_any(), self.selector);
            self.pod = Some(pod);
        }
        self.pod
            .as_ref()
            .ok_or_else(|| Error::NotFound {
                kind: "pod",
                name: self.selector.clone(),
            })
    }

    /// Drop the cached pod, e.g. after a mutation that may restart it
    pub fn invalidate(&mut self) {
        self.pod = None;
    }

    pub async fn refresh(&mut self, probe: &dyn RuntimeProbe) -> Result<&Pod> {
        self.invalidate();
        self.get(probe).await
    }
}

/// Where synced source goes: the first container declaring the projects
/// root marker, and the path it names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncTarget {
    pub container: String,
    pub sync_folder: String,
}

pub fn first_container_with_source_volume(containers: &[Container]) -> Result<SyncTarget> {
    containers
        .iter()
        .find_map(|c| {
            c.env.as_ref().and_then(|env| {
                env.iter().find(|e| e.name == ENV_PROJECTS_ROOT).map(|e| SyncTarget {
                    container: c.name.clone(),
                    sync_folder: e.value.clone().unwrap_or_default(),
                })
            })
        })
        .ok_or(Error::SyncTargetMissing)
}

/// Sync target of a running pod
pub fn sync_target(pod: &Pod) -> Result<SyncTarget> {
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();
    first_container_with_source_volume(containers)
}

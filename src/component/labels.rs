//! Labels, selectors and fixed names shared by the component resources

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

/// Label every component resource is selected by
pub const COMPONENT_LABEL: &str = "component";
pub const APP_LABEL: &str = "app";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_TYPE_LABEL: &str = "app.kubernetes.io/name";
/// Label on a claim carrying the devfile volume name it backs
pub const STORAGE_LABEL: &str = "app.kubernetes.io/storage-name";

pub const MANAGED_BY: &str = "devpush";

/// Env var marking the container(s) that receive synced source; the value is
/// the mount path inside the container
pub const ENV_PROJECTS_ROOT: &str = "PROJECTS_ROOT";
pub const PROJECTS_VOLUME_NAME: &str = "devpush-projects";

pub const SUPERVISORD_VOLUME_NAME: &str = "devpush-supervisord-shared-data";
pub const SUPERVISORD_MOUNT_PATH: &str = "/opt/devpush/";
pub const SUPERVISORD_BINARY_PATH: &str = "/opt/devpush/bin/supervisord";
pub const SUPERVISORD_CONF_FILE: &str = "/opt/devpush/conf/devfile-supervisor.conf";
pub const SUPERVISORD_INIT_CONTAINER: &str = "copy-supervisord";

/// Env vars the supervisord config reads the programs from
pub const ENV_COMMAND_RUN: &str = "DEVPUSH_COMMAND_RUN";
pub const ENV_COMMAND_RUN_WORKING_DIR: &str = "DEVPUSH_COMMAND_RUN_WORKING_DIR";
pub const ENV_COMMAND_DEBUG: &str = "DEVPUSH_COMMAND_DEBUG";
pub const ENV_COMMAND_DEBUG_WORKING_DIR: &str = "DEVPUSH_COMMAND_DEBUG_WORKING_DIR";
pub const ENV_DEBUG_PORT: &str = "DEBUG_PORT";

/// `component=<name>`
pub fn selector(component: &str) -> String {
    format!("{COMPONENT_LABEL}={component}")
}

pub fn selector_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(COMPONENT_LABEL.to_string(), component.to_string())])
}

/// Get the standard labels for a component's resources
pub fn standard_labels(
    component: &str,
    app: &str,
    component_type: &str,
) -> BTreeMap<String, String> {
    let mut labels = selector_labels(component);
    labels.insert(INSTANCE_LABEL.to_string(), component.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    if !app.is_empty() {
        labels.insert(APP_LABEL.to_string(), app.to_string());
        labels.insert(PART_OF_LABEL.to_string(), app.to_string());
    }
    if !component_type.is_empty() {
        labels.insert(COMPONENT_TYPE_LABEL.to_string(), component_type.to_string());
    }
    labels
}

/// Create an OwnerReference pointing at the deployment for garbage collection
pub fn owner_reference(deployment: &Deployment) -> OwnerReference {
    OwnerReference {
        api_version: Deployment::api_version(&()).to_string(),
        kind: Deployment::kind(&()).to_string(),
        name: deployment.name_any(),
        uid: deployment.metadata.uid.clone().unwrap_or_default(),
        controller: None,
        block_owner_deletion: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn test_selector_convention() {
        assert_eq!(selector("nodejs"), "component=nodejs");
    }

    #[test]
    fn test_standard_labels_include_selector_and_app() {
        let labels = standard_labels("nodejs", "shop", "nodejs");
        assert_eq!(labels.get(COMPONENT_LABEL).unwrap(), "nodejs");
        assert_eq!(labels.get(APP_LABEL).unwrap(), "shop");
        assert_eq!(labels.get(MANAGED_BY_LABEL).unwrap(), MANAGED_BY);
    }

    #[test]
    fn test_standard_labels_skip_empty_app() {
        let labels = standard_labels("nodejs", "", "");
        assert!(!labels.contains_key(APP_LABEL));
        assert!(!labels.contains_key(COMPONENT_TYPE_LABEL));
    }

    #[test]
    fn test_owner_reference_points_at_deployment() {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("nodejs".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let owner = owner_reference(&deployment);
        assert_eq!(owner.api_version, "apps/v1");
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.name, "nodejs");
        assert_eq!(owner.uid, "uid-1");
    }
}

//! Readiness predicates following Kubernetes API conventions

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::wait::Condition;

pub const POD_PHASE_RUNNING: &str = "Running";
pub const POD_PHASE_UNKNOWN: &str = "Unknown";

/// Reason set on the `Progressing` condition once the new ReplicaSet is live
const NEW_REPLICA_SET_AVAILABLE: &str = "NewReplicaSetAvailable";

pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or(POD_PHASE_UNKNOWN)
}

pub fn is_pod_running(pod: &Pod) -> bool {
    pod_phase(pod) == POD_PHASE_RUNNING && pod.metadata.deletion_timestamp.is_none()
}

/// True once the controller has observed the latest generation and every
/// desired replica is updated and available.
pub fn is_rollout_complete(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };

    let generation = deployment.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return false;
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);

    // Old replicas still terminating
    if total > updated {
        return false;
    }
    if updated < desired || available < updated {
        return false;
    }

    status
        .conditions
        .as_ref()
        .map(|conds| {
            conds.iter().any(|c| {
                c.type_ == "Progressing"
                    && c.status == "True"
                    && c.reason.as_deref() == Some(NEW_REPLICA_SET_AVAILABLE)
            })
        })
        .unwrap_or(true)
}

/// `await_condition` adapter for [`is_rollout_complete`]
pub fn rollout_complete() -> impl Condition<Deployment> {
    |obj: Option<&Deployment>| obj.map(is_rollout_complete).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::PodStatus;
    use kube::api::ObjectMeta;

    fn deployment(generation: i64, observed: i64, updated: i32, available: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("nodejs".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                replicas: Some(updated),
                updated_replicas: Some(updated),
                available_replicas: Some(available),
                conditions: Some(vec![DeploymentCondition {
                    type_: "Progressing".to_string(),
                    status: "True".to_string(),
                    reason: Some(NEW_REPLICA_SET_AVAILABLE.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_rollout_complete_when_all_replicas_available() {
        assert!(is_rollout_complete(&deployment(2, 2, 1, 1)));
    }

    #[test]
    fn test_rollout_incomplete_when_generation_not_observed() {
        assert!(!is_rollout_complete(&deployment(3, 2, 1, 1)));
    }

    #[test]
    fn test_rollout_incomplete_when_replica_unavailable() {
        assert!(!is_rollout_complete(&deployment(1, 1, 1, 0)));
    }

    #[test]
    fn test_rollout_condition_on_missing_object() {
        let cond = rollout_complete();
        assert!(!cond.matches_object(None));
        assert!(cond.matches_object(Some(&deployment(1, 1, 1, 1))));
    }

    #[test]
    fn test_pod_phase_defaults_to_unknown() {
        let pod = Pod::default();
        assert_eq!(pod_phase(&pod), POD_PHASE_UNKNOWN);
        assert!(!is_pod_running(&pod));

        let running = Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(is_pod_running(&running));
    }
}

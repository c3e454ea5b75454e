//! Error types for devpush
//!
//! One error enum covers validation, cluster, execution and supervisor
//! failures so every operation in the crate can use `?` on any of them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error that was not mapped to a more specific variant
    #[error("Kubernetes error: {0}")]
    KubeError(#[from] kube::Error),

    /// Bad resource name or command binding. Always raised before mutation.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No workload or pod for the component
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// The name is still held by another object, possibly one being deleted
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// A watch on the cluster ended with an error
    #[error("watch failed: {0}")]
    Watch(String),

    /// The current credentials may not query the resource
    #[error("insufficient permissions: {0}")]
    Forbidden(String),

    /// Creating, updating or deleting a workload resource failed
    #[error("unable to {operation} {resource}: {source}")]
    ClusterMutation {
        resource: String,
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("no valid components found in the devfile")]
    NoValidContainers,

    #[error("unable to find secret in ServiceBinding {0}")]
    MissingBoundSecret(String),

    #[error(
        "in order to sync files, at least one component in the devfile must set 'mountSources: true'"
    )]
    SyncTargetMissing,

    #[error("the supervisord program {0} not found")]
    SupervisorProgramMissing(String),

    #[error("failed to execute devfile command \"{id}\": {message}")]
    CommandExecution { id: String, message: String },

    #[error("pod for component {component} is not running, current status={phase}")]
    PodNotRunning { component: String, phase: String },

    #[error("timed out {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Build a `map_err` adapter tagging a failure with the resource and
    /// operation it happened on.
    pub fn mutation(
        resource: impl Into<String>,
        operation: &'static str,
    ) -> impl FnOnce(Error) -> Error {
        let resource = resource.into();
        move |source| Error::ClusterMutation {
            resource,
            operation,
            source: Box::new(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Forbidden(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

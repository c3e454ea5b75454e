//! Component module for devfile component pushes
//! This module contains the push flow, workload reconciliation and the
//! command and supervisor handling inside the component pod.

mod adapter;
mod context;
pub mod executor;
pub mod labels;
mod probe;
mod reconciler;
pub mod resources;
pub mod supervisor;
#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{ComponentAdapter, ErrorSink, PushOutcome};
pub use context::{PushContext, PushParameters};
pub use executor::CommandExecutor;
pub use probe::{first_container_with_source_volume, sync_target, PodCache, SyncTarget};
pub use reconciler::{reconcile_volume_ownership, ResourceReconciler};
pub use supervisor::{ProgramStatus, SupervisorMonitor, DEBUG_PROGRAM, RUN_PROGRAM};

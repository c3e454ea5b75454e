//! devpush: push devfile components onto Kubernetes
//!
//! This crate reconciles a devfile component into a Deployment, Service and
//! PersistentVolumeClaims, syncs the project sources into the running pod and
//! runs the devfile build/run commands under an in-container supervisord.

pub mod cluster;
pub mod component;
pub mod config;
pub mod devfile;
pub mod error;
pub mod sync;

pub use crate::error::{Error, Result};

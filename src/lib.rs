//! deployd: declarative container deployments
//!
//! Clients declare deployments (an image and a replica count) over HTTP. A
//! single reconcile loop keeps the container runtime matching them: it
//! creates missing containers, removes surplus ones, and collects containers
//! whose deployment is gone. Containers without the ownership label are
//! never touched.

pub mod api;
pub mod config;
pub mod deployment;
pub mod reconcile;
pub mod runtime;

pub use config::Config;
pub use deployment::{Deployment, DeploymentId, DeploymentRequest, DeploymentStore};
pub use reconcile::{CycleReport, Reconciler, Trigger, TriggerMerger};
pub use runtime::{ContainerRuntime, InMemoryRuntime};

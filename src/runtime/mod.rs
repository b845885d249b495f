//! Container runtime adapters
//!
//! The reconcile engine only ever talks to a runtime through
//! [`ContainerRuntime`]. Two implementations ship:
//!
//! - [`DockerCli`] drives a local Docker daemon through the `docker` binary
//! - [`InMemoryRuntime`] keeps containers in a map, for dry runs and tests

pub mod docker;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use docker::DockerCli;
pub use memory::InMemoryRuntime;

use crate::config::{RuntimeConfig, RuntimeKind};

/// Runtime-assigned container identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, the way `docker ps` prints IDs
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One container as reported by the runtime, valid for a single cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedInstance {
    pub id: InstanceId,
    pub name: String,
    pub image: String,
    /// Runtime lifecycle phase (`running`, `exited`, `created`, ...)
    pub state: String,
    /// Labels as far as the adapter reports them; the Docker adapter only
    /// reports the ownership label
    pub labels: HashMap<String, String>,
}

impl ObservedInstance {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Kind of object a runtime event refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Container,
    Image,
    Network,
    Volume,
    Other(String),
}

impl From<&str> for ObjectKind {
    fn from(s: &str) -> Self {
        match s {
            "container" => Self::Container,
            "image" => Self::Image,
            "network" => Self::Network,
            "volume" => Self::Volume,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A raw runtime event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub kind: ObjectKind,
    pub action: String,
    pub object_id: String,
}

impl RuntimeEvent {
    /// Whether this event reports a container being destroyed
    pub fn is_container_destroy(&self) -> bool {
        self.kind == ObjectKind::Container && self.action == "destroy"
    }
}

/// Event and error streams from [`ContainerRuntime::subscribe_events`].
///
/// Both channels close when the underlying subscription ends.
pub struct EventSubscription {
    pub events: mpsc::Receiver<RuntimeEvent>,
    pub errors: mpsc::Receiver<RuntimeError>,
}

/// Runtime errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to run runtime command: {0}")]
    Spawn(String),

    #[error("Runtime command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Runtime command `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Invalid runtime output: {0}")]
    InvalidOutput(String),

    #[error("Instance not found: {0}")]
    NotFound(InstanceId),

    #[error("Instance name already in use: {0}")]
    NameConflict(String),

    #[error("Event stream error: {0}")]
    EventStream(String),

    #[error("Injected failure: {0}")]
    Injected(String),
}

/// The full capability surface the reconcile engine needs from a runtime
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Every container the runtime knows about, stopped ones included
    async fn list_all(&self) -> Result<Vec<ObservedInstance>, RuntimeError>;

    /// Create (but do not start) a container
    async fn create(
        &self,
        image: &str,
        labels: &HashMap<String, String>,
        name: &str,
    ) -> Result<InstanceId, RuntimeError>;

    async fn start(&self, id: &InstanceId) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &InstanceId, force: bool) -> Result<(), RuntimeError>;

    /// Subscribe to container destroy events
    async fn subscribe_events(&self) -> Result<EventSubscription, RuntimeError>;
}

/// Build the runtime selected in config.
///
/// `owner_label` is the only label the Docker adapter reports on listed
/// containers.
pub fn from_config(config: &RuntimeConfig, owner_label: &str) -> Arc<dyn ContainerRuntime> {
    match config.kind {
        RuntimeKind::Docker => Arc::new(DockerCli::new(config, owner_label)),
        RuntimeKind::Memory => Arc::new(InMemoryRuntime::new()),
    }
}

//! Deployments - the desired half of the reconcile loop
//!
//! A deployment names an image and how many containers of it should exist.
//! Records live only in memory, inside the [`DeploymentStore`].

pub mod store;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use store::{DeploymentStore, StoreError};

/// Opaque deployment identifier, assigned once at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(Uuid);

impl DeploymentId {
    /// Generate a fresh random ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeploymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DeploymentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A deployment as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    pub image: String,
    pub replicas: u32,
}

impl Deployment {
    /// Attach an ID to a request
    pub fn from_request(id: DeploymentId, request: DeploymentRequest) -> Self {
        Self {
            id,
            name: request.name,
            image: request.image,
            replicas: request.replicas,
        }
    }
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) * {}", self.name, self.image, self.replicas)
    }
}

/// Everything in a deployment except its ID.
///
/// Used for both create and replace; a replace overwrites every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub name: String,
    pub image: String,
    pub replicas: u32,
}

impl DeploymentRequest {
    pub fn new(name: impl Into<String>, image: impl Into<String>, replicas: u32) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            replicas,
        }
    }
}

/// Whether `name` can prefix a container name: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`,
/// the set Docker accepts for container names.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    }
}

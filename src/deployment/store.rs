//! Desired-state store
//!
//! Holds every deployment behind one lock. Each successful mutation fires the
//! single subscriber's trigger while the lock is still held, so the engine can
//! never take a snapshot that misses a mutation it was woken for.

use std::collections::HashMap;
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Deployment, DeploymentId, DeploymentRequest};
use crate::reconcile::Trigger;

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Deployment not found: {0}")]
    NotFound(DeploymentId),
}

/// In-memory deployment store with a single change subscriber
pub struct DeploymentStore {
    deployments: Mutex<HashMap<DeploymentId, Deployment>>,
    subscriber: OnceLock<Trigger>,
}

impl DeploymentStore {
    pub fn new() -> Self {
        Self {
            deployments: Mutex::new(HashMap::new()),
            subscriber: OnceLock::new(),
        }
    }

    /// Attach the change subscriber.
    ///
    /// # Panics
    ///
    /// Panics if a subscriber is already attached. There is exactly one
    /// reconcile loop per store; a second one is a wiring bug.
    pub fn subscribe(&self, trigger: Trigger) {
        if self.subscriber.set(trigger).is_err() {
            panic!("deployment store already has a subscriber");
        }
    }

    /// Snapshot of all deployments, in no particular order
    pub async fn list(&self) -> Vec<Deployment> {
        let deployments = self.deployments.lock().await;
        deployments.values().cloned().collect()
    }

    /// Look up one deployment
    pub async fn get(&self, id: &DeploymentId) -> Result<Deployment, StoreError> {
        let deployments = self.deployments.lock().await;
        deployments
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }

    /// Store a new deployment under a fresh ID
    pub async fn create(&self, request: DeploymentRequest) -> Deployment {
        let mut deployments = self.deployments.lock().await;

        let mut id = DeploymentId::new();
        while deployments.contains_key(&id) {
            id = DeploymentId::new();
        }

        let deployment = Deployment::from_request(id, request);
        deployments.insert(id, deployment.clone());
        info!(deployment_id = %id, deployment = %deployment, "Deployment created");

        self.emit_changed();
        deployment
    }

    /// Overwrite an existing deployment, keeping its ID
    pub async fn replace(
        &self,
        id: &DeploymentId,
        request: DeploymentRequest,
    ) -> Result<Deployment, StoreError> {
        let mut deployments = self.deployments.lock().await;

        let slot = deployments.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        *slot = Deployment::from_request(*id, request);
        let deployment = slot.clone();
        info!(deployment_id = %id, deployment = %deployment, "Deployment replaced");

        self.emit_changed();
        Ok(deployment)
    }

    /// Remove a deployment
    pub async fn delete(&self, id: &DeploymentId) -> Result<(), StoreError> {
        let mut deployments = self.deployments.lock().await;

        let removed = deployments.remove(id).ok_or(StoreError::NotFound(*id))?;
        info!(deployment_id = %id, deployment = %removed, "Deployment deleted");

        self.emit_changed();
        Ok(())
    }

    /// Must be called with the map lock held
    fn emit_changed(&self) {
        match self.subscriber.get() {
            Some(trigger) => {
                let queued = trigger.fire();
                debug!(queued, "Deployment change notified");
            }
            None => debug!("Deployment changed with no subscriber attached"),
        }
    }
}

impl Default for DeploymentStore {
    fn default() -> Self {
        Self::new()
    }
}

//! Reconcile - drives the runtime towards the desired deployments
//!
//! # Cycle
//!
//! ```text
//!   Idle ──wakeup──▶ Listing ──▶ Diffing ──▶ Converging ──┐
//!    ▲                                                     │
//!    └─────────────────────────────────────────────────────┘
//! ```
//!
//! Each cycle starts from scratch: snapshot the store, list every container,
//! group the managed ones by owner, then create or remove until each
//! deployment has exactly its replica count. Managed containers whose
//! deployment is gone are removed. Nothing is remembered between cycles and
//! nothing is retried within one; the next wakeup picks up whatever is left.

pub mod ownership;
pub mod trigger;

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::deployment::{Deployment, DeploymentId, DeploymentStore};
use crate::runtime::{ContainerRuntime, ObservedInstance, RuntimeError};

pub use ownership::{classify, Ownership};
pub use trigger::{Trigger, TriggerMerger};

/// What one cycle did. Only used for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Deployments in the store snapshot
    pub desired: usize,
    /// Containers listed, managed or not
    pub observed: usize,
    /// Containers without the ownership label
    pub unmanaged: usize,
    pub created: usize,
    pub create_failures: usize,
    pub start_failures: usize,
    /// Surplus containers removed from live deployments
    pub removed: usize,
    /// Containers removed because their deployment is gone
    pub orphans_removed: usize,
    pub remove_failures: usize,
}

impl CycleReport {
    /// Failed creates, starts and removes
    pub fn failures(&self) -> usize {
        self.create_failures + self.start_failures + self.remove_failures
    }

    /// Whether the cycle issued any create or remove
    pub fn changed(&self) -> bool {
        self.created + self.create_failures + self.removed + self.orphans_removed + self.remove_failures > 0
    }
}

enum CreateOutcome {
    Started,
    /// Created but not started; still counts towards the replica total
    NotStarted,
    Failed,
}

/// The reconcile engine
pub struct Reconciler {
    store: Arc<DeploymentStore>,
    runtime: Arc<dyn ContainerRuntime>,
    owner_label: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<DeploymentStore>,
        runtime: Arc<dyn ContainerRuntime>,
        config: &ReconcileConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            owner_label: config.owner_label.clone(),
        }
    }

    /// Run cycles forever, one per wakeup.
    ///
    /// Cycle errors are logged; the loop itself never exits.
    pub async fn run(self, mut merger: TriggerMerger) {
        info!(owner_label = %self.owner_label, "Reconciler started");

        loop {
            merger.wait().await;
            debug!("Reconciling");

            if let Err(e) = self.reconcile_once().await {
                error!(error = %e, "Error reading runtime state, skipping cycle");
            }
        }
    }

    /// One full Listing → Diffing → Converging pass.
    ///
    /// Fails only if the runtime cannot be listed, in which case nothing was
    /// created or removed. Individual create/start/remove failures are logged
    /// and counted in the report.
    pub async fn reconcile_once(&self) -> Result<CycleReport, RuntimeError> {
        let desired = self.store.list().await;
        let actual = self.runtime.list_all().await?;

        let mut report = CycleReport {
            desired: desired.len(),
            observed: actual.len(),
            ..Default::default()
        };

        let mut ownership = classify(actual, &self.owner_label);
        report.unmanaged = ownership.unmanaged.len();
        for instance in &ownership.unmanaged {
            debug!(
                instance_id = %instance.id.short(),
                name = %instance.name,
                image = %instance.image,
                "Container not one of ours, ignoring"
            );
        }

        for deployment in &desired {
            let observed = ownership.take(&deployment.id.to_string());
            self.converge(deployment, observed, &mut report).await;
        }

        // Whatever is left carries our label but has no deployment any more
        for (owner, orphans) in ownership.owned.drain() {
            info!(
                owner = %owner,
                count = orphans.len(),
                "Removing containers of a deployment that no longer exists"
            );
            for instance in &orphans {
                if self.remove_instance(instance, &owner).await {
                    report.orphans_removed += 1;
                } else {
                    report.remove_failures += 1;
                }
            }
        }

        if report.changed() {
            info!(
                desired = report.desired,
                observed = report.observed,
                created = report.created,
                removed = report.removed + report.orphans_removed,
                failures = report.failures(),
                "Reconcile cycle complete"
            );
        } else {
            debug!(
                desired = report.desired,
                observed = report.observed,
                "Reconcile cycle complete, nothing to do"
            );
        }

        Ok(report)
    }

    /// Close the gap for one deployment
    async fn converge(
        &self,
        deployment: &Deployment,
        observed: Vec<ObservedInstance>,
        report: &mut CycleReport,
    ) {
        let want = deployment.replicas as usize;
        let have = observed.len();

        debug!(
            deployment_id = %deployment.id,
            deployment = %deployment,
            have,
            want,
            "Diffed deployment"
        );

        if want > have {
            for _ in 0..want - have {
                match self.create_instance(deployment).await {
                    CreateOutcome::Started => report.created += 1,
                    CreateOutcome::NotStarted => {
                        report.created += 1;
                        report.start_failures += 1;
                    }
                    CreateOutcome::Failed => report.create_failures += 1,
                }
            }
        } else if have > want {
            let owner = deployment.id.to_string();
            // Any surplus will do; take them in listing order
            for instance in observed.iter().take(have - want) {
                if self.remove_instance(instance, &owner).await {
                    report.removed += 1;
                } else {
                    report.remove_failures += 1;
                }
            }
        }
    }

    async fn create_instance(&self, deployment: &Deployment) -> CreateOutcome {
        let name = instance_name(&deployment.name);
        let labels = ownership_labels(&self.owner_label, &deployment.id);

        info!(
            deployment_id = %deployment.id,
            name = %name,
            image = %deployment.image,
            "Creating container"
        );

        let id = match self.runtime.create(&deployment.image, &labels, &name).await {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    deployment_id = %deployment.id,
                    name = %name,
                    error = %e,
                    "Error creating container"
                );
                return CreateOutcome::Failed;
            }
        };

        if let Err(e) = self.runtime.start(&id).await {
            warn!(
                deployment_id = %deployment.id,
                instance_id = %id.short(),
                name = %name,
                error = %e,
                "Error starting container"
            );
            return CreateOutcome::NotStarted;
        }

        CreateOutcome::Started
    }

    async fn remove_instance(&self, instance: &ObservedInstance, owner: &str) -> bool {
        info!(
            owner = %owner,
            instance_id = %instance.id.short(),
            name = %instance.name,
            "Removing container"
        );

        match self.runtime.remove(&instance.id, true).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    owner = %owner,
                    instance_id = %instance.id.short(),
                    name = %instance.name,
                    error = %e,
                    "Error removing container"
                );
                false
            }
        }
    }
}

/// `<name>-<6 random digits>`. Collisions are possible and surface as
/// ordinary create failures.
pub fn instance_name(deployment_name: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
    format!("{}-{}", deployment_name, suffix)
}

fn ownership_labels(label: &str, id: &DeploymentId) -> HashMap<String, String> {
    HashMap::from([(label.to_string(), id.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::DeploymentRequest;
    use crate::runtime::InMemoryRuntime;

    fn setup() -> (Arc<DeploymentStore>, Arc<InMemoryRuntime>, Reconciler) {
        let store = Arc::new(DeploymentStore::new());
        let runtime = Arc::new(InMemoryRuntime::new());
        let reconciler = Reconciler::new(store.clone(), runtime.clone(), &ReconcileConfig::default());
        (store, runtime, reconciler)
    }

    #[test]
    fn test_instance_name_format() {
        for _ in 0..100 {
            let name = instance_name("web");
            let (prefix, suffix) = name.rsplit_once('-').unwrap();
            assert_eq!(prefix, "web");
            assert_eq!(suffix.len(), 6);
            let n: u32 = suffix.parse().unwrap();
            assert!((100_000..1_000_000).contains(&n));
        }
    }

    #[test]
    fn test_instance_name_keeps_dashes() {
        let name = instance_name("my-app");
        assert!(name.starts_with("my-app-"));
    }

    #[tokio::test]
    async fn test_empty_cycle() {
        let (_, runtime, reconciler) = setup();

        let report = reconciler.reconcile_once().await.unwrap();

        assert!(!report.changed());
        assert_eq!(runtime.counts().creates, 0);
    }

    #[tokio::test]
    async fn test_creates_started_and_labelled() {
        let (store, runtime, reconciler) = setup();
        let dep = store.create(DeploymentRequest::new("web", "nginx", 2)).await;

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.created, 2);

        let owned = runtime.instances_labelled("owner", &dep.id.to_string()).await;
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().all(|c| c.state == "running"));
        assert!(owned.iter().all(|c| c.image == "nginx"));
        assert!(owned.iter().all(|c| c.name.starts_with("web-")));
    }

    #[tokio::test]
    async fn test_start_failure_still_counts_next_cycle() {
        let (store, runtime, reconciler) = setup();
        store.create(DeploymentRequest::new("web", "nginx", 1)).await;

        runtime.fail_start(true);
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.start_failures, 1);
        assert_eq!(report.failures(), 1);
        assert!(report.changed());

        runtime.fail_start(false);
        let report = reconciler.reconcile_once().await.unwrap();
        assert!(!report.changed());
        assert_eq!(runtime.instances().await.len(), 1);
        assert_eq!(runtime.instances().await[0].state, "created");
    }

    #[tokio::test]
    async fn test_second_cycle_is_noop() {
        let (store, runtime, reconciler) = setup();
        store.create(DeploymentRequest::new("web", "nginx", 3)).await;

        reconciler.reconcile_once().await.unwrap();
        let report = reconciler.reconcile_once().await.unwrap();

        assert!(!report.changed());
        assert_eq!(runtime.counts().creates, 3);
    }
}

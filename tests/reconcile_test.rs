//! Reconcile engine integration tests against the in-memory runtime

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deployd::config::ReconcileConfig;
use deployd::deployment::{DeploymentId, DeploymentRequest, DeploymentStore};
use deployd::reconcile::{Reconciler, TriggerMerger};
use deployd::runtime::{ContainerRuntime, InMemoryRuntime, ObservedInstance};

const OWNER: &str = "owner";

struct Harness {
    store: Arc<DeploymentStore>,
    runtime: Arc<InMemoryRuntime>,
    reconciler: Reconciler,
}

fn harness() -> Harness {
    let store = Arc::new(DeploymentStore::new());
    let runtime = Arc::new(InMemoryRuntime::new());
    let reconciler = Reconciler::new(store.clone(), runtime.clone(), &ReconcileConfig::default());
    Harness {
        store,
        runtime,
        reconciler,
    }
}

fn owned_by(id: &DeploymentId) -> HashMap<String, String> {
    HashMap::from([(OWNER.to_string(), id.to_string())])
}

impl Harness {
    async fn seed_owned(&self, id: &DeploymentId, count: usize) {
        for i in 0..count {
            self.runtime
                .insert(&format!("seed-{}-{}", id, i), "nginx", owned_by(id), "running")
                .await;
        }
    }

    async fn owned(&self, id: &DeploymentId) -> usize {
        self.runtime.instances_labelled(OWNER, &id.to_string()).await.len()
    }
}

#[tokio::test]
async fn test_zero_owned_creates_exactly_replicas() {
    let h = harness();
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 4)).await;

    let report = h.reconciler.reconcile_once().await.unwrap();

    assert_eq!(report.created, 4);
    assert_eq!(h.runtime.counts().creates, 4);
    assert_eq!(h.runtime.counts().removes, 0);
    assert_eq!(h.owned(&dep.id).await, 4);
}

#[tokio::test]
async fn test_scale_up_from_one() {
    let h = harness();
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 3)).await;
    h.seed_owned(&dep.id, 1).await;

    let report = h.reconciler.reconcile_once().await.unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.removed, 0);
    assert_eq!(h.owned(&dep.id).await, 3);
}

#[tokio::test]
async fn test_surplus_removed() {
    let h = harness();
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 2)).await;
    h.seed_owned(&dep.id, 5).await;

    let report = h.reconciler.reconcile_once().await.unwrap();

    assert_eq!(report.removed, 3);
    assert_eq!(report.created, 0);
    assert_eq!(h.runtime.counts().removes, 3);
    assert_eq!(h.owned(&dep.id).await, 2);
}

#[tokio::test]
async fn test_deleted_deployment_collected() {
    let h = harness();
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 3)).await;
    h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(h.owned(&dep.id).await, 3);

    h.store.delete(&dep.id).await.unwrap();
    let report = h.reconciler.reconcile_once().await.unwrap();

    assert_eq!(report.orphans_removed, 3);
    assert_eq!(h.owned(&dep.id).await, 0);
    assert!(h.runtime.instances().await.is_empty());
}

#[tokio::test]
async fn test_unknown_owner_removed() {
    let h = harness();
    let stranger = DeploymentId::new();
    h.seed_owned(&stranger, 1).await;
    h.runtime
        .insert(
            "garbage",
            "nginx",
            HashMap::from([(OWNER.to_string(), "not-a-uuid".to_string())]),
            "exited",
        )
        .await;

    let report = h.reconciler.reconcile_once().await.unwrap();

    assert_eq!(report.orphans_removed, 2);
    assert!(h.runtime.instances().await.is_empty());
}

#[tokio::test]
async fn test_unmanaged_never_touched() {
    let h = harness();
    h.runtime.insert("db", "postgres", HashMap::new(), "running").await;
    h.runtime
        .insert(
            "cache",
            "redis",
            HashMap::from([("com.example.team".to_string(), "infra".to_string())]),
            "exited",
        )
        .await;
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 1)).await;

    let report = h.reconciler.reconcile_once().await.unwrap();

    assert_eq!(report.unmanaged, 2);
    assert_eq!(report.created, 1);
    assert_eq!(report.removed + report.orphans_removed, 0);
    assert_eq!(h.owned(&dep.id).await, 1);

    let names: Vec<String> = h.runtime.instances().await.into_iter().map(|c| c.name).collect();
    assert!(names.contains(&"db".to_string()));
    assert!(names.contains(&"cache".to_string()));

    // Deleting everything still leaves them alone
    h.store.delete(&dep.id).await.unwrap();
    h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(h.runtime.instances().await.len(), 2);
}

#[tokio::test]
async fn test_listing_failure_touches_nothing() {
    let h = harness();
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 3)).await;
    h.runtime.insert("orphan", "nginx", owned_by(&DeploymentId::new()), "running").await;

    h.runtime.fail_list(true);
    assert!(h.reconciler.reconcile_once().await.is_err());

    assert_eq!(h.runtime.counts().creates, 0);
    assert_eq!(h.runtime.counts().removes, 0);

    h.runtime.fail_list(false);
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.created, 3);
    assert_eq!(report.orphans_removed, 1);
    assert_eq!(h.owned(&dep.id).await, 3);
}

#[tokio::test]
async fn test_scale_down_ignores_image_and_name() {
    let h = harness();
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 3)).await;
    h.reconciler.reconcile_once().await.unwrap();

    h.store
        .replace(&dep.id, DeploymentRequest::new("renamed", "httpd", 1))
        .await
        .unwrap();
    let report = h.reconciler.reconcile_once().await.unwrap();

    assert_eq!(report.removed, 2);
    assert_eq!(report.created, 0);

    // The survivor keeps the old image; content changes are not rolled out
    let left = h.runtime.instances_labelled(OWNER, &dep.id.to_string()).await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].image, "nginx");
    assert!(left[0].name.starts_with("web-"));
}

#[tokio::test]
async fn test_create_failure_retried_next_cycle() {
    let h = harness();
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 2)).await;

    h.runtime.fail_create(true);
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.create_failures, 2);
    assert_eq!(h.owned(&dep.id).await, 0);

    h.runtime.fail_create(false);
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(h.owned(&dep.id).await, 2);
}

#[tokio::test]
async fn test_remove_failure_retried_next_cycle() {
    let h = harness();
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 1)).await;
    h.seed_owned(&dep.id, 3).await;

    h.runtime.fail_remove(true);
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.remove_failures, 2);
    assert_eq!(h.owned(&dep.id).await, 3);

    h.runtime.fail_remove(false);
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.removed, 2);
    assert_eq!(h.owned(&dep.id).await, 1);
}

#[tokio::test]
async fn test_stopped_containers_count_as_replicas() {
    let h = harness();
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 2)).await;
    for i in 0..2 {
        h.runtime
            .insert(&format!("web-{}", i), "nginx", owned_by(&dep.id), "exited")
            .await;
    }

    let report = h.reconciler.reconcile_once().await.unwrap();

    assert!(!report.changed());
}

#[tokio::test]
async fn test_zero_replicas_removes_all() {
    let h = harness();
    let dep = h.store.create(DeploymentRequest::new("web", "nginx", 0)).await;
    h.seed_owned(&dep.id, 2).await;

    let report = h.reconciler.reconcile_once().await.unwrap();

    assert_eq!(report.removed, 2);
    assert_eq!(h.owned(&dep.id).await, 0);
}

#[tokio::test]
async fn test_custom_owner_label() {
    let store = Arc::new(DeploymentStore::new());
    let runtime = Arc::new(InMemoryRuntime::new());
    let config = ReconcileConfig {
        owner_label: "io.deployd.owner".to_string(),
        ..Default::default()
    };
    let reconciler = Reconciler::new(store.clone(), runtime.clone(), &config);

    // Labelled with the default key: not ours under this config
    runtime
        .insert("legacy", "nginx", owned_by(&DeploymentId::new()), "running")
        .await;
    let dep = store.create(DeploymentRequest::new("web", "nginx", 1)).await;

    let report = reconciler.reconcile_once().await.unwrap();

    assert_eq!(report.unmanaged, 1);
    assert_eq!(report.created, 1);
    assert_eq!(
        runtime
            .instances_labelled("io.deployd.owner", &dep.id.to_string())
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_loop_converges_and_heals() {
    let store = Arc::new(DeploymentStore::new());
    let runtime = Arc::new(InMemoryRuntime::new());

    let mut merger = TriggerMerger::new();
    store.subscribe(merger.trigger());
    merger.watch_runtime(runtime.clone(), Duration::from_millis(10));

    let reconciler = Reconciler::new(store.clone(), runtime.clone(), &ReconcileConfig::default());
    let task = tokio::spawn(reconciler.run(merger));

    // Let the event forwarder subscribe
    tokio::time::sleep(Duration::from_millis(50)).await;

    let dep = store.create(DeploymentRequest::new("web", "nginx", 2)).await;
    let label = dep.id.to_string();
    let owned = |all: &[ObservedInstance]| {
        all.iter()
            .filter(|c| c.label(OWNER) == Some(label.as_str()))
            .count()
    };

    wait_for(&runtime, |all| owned(all) == 2).await;

    // Someone removes a container behind our back
    let victim = runtime.instances_labelled(OWNER, &label).await[0].id.clone();
    runtime.remove(&victim, true).await.unwrap();

    wait_for(&runtime, |all| {
        owned(all) == 2 && all.iter().all(|c| c.id != victim)
    })
    .await;

    store.delete(&dep.id).await.unwrap();
    wait_for(&runtime, |all| all.is_empty()).await;

    task.abort();
}

async fn wait_for(runtime: &InMemoryRuntime, check: impl Fn(&[ObservedInstance]) -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !check(&runtime.instances().await) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached in time");
}

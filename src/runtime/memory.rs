//! In-memory runtime
//!
//! Keeps containers in a map and behaves like a well-mannered daemon:
//! names must be unique, removal emits a `destroy` event. Each operation can
//! be made to fail on demand, which is how partial-failure handling in the
//! reconcile engine is exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{
    ContainerRuntime, EventSubscription, InstanceId, ObjectKind, ObservedInstance, RuntimeError,
    RuntimeEvent,
};

const EVENT_BUFFER: usize = 64;

/// Which operations should fail
#[derive(Debug, Default)]
struct Faults {
    list: AtomicBool,
    create: AtomicBool,
    start: AtomicBool,
    remove: AtomicBool,
}

/// Number of successful mutating calls seen so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCounts {
    pub creates: usize,
    pub starts: usize,
    pub removes: usize,
}

/// Map-backed [`ContainerRuntime`]
#[derive(Default)]
pub struct InMemoryRuntime {
    containers: Mutex<BTreeMap<InstanceId, ObservedInstance>>,
    subscribers: Mutex<Vec<mpsc::Sender<RuntimeEvent>>>,
    next_id: AtomicU64,
    faults: Faults,
    creates: AtomicUsize,
    starts: AtomicUsize,
    removes: AtomicUsize,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a container directly, bypassing `create`
    pub async fn insert(
        &self,
        name: &str,
        image: &str,
        labels: HashMap<String, String>,
        state: &str,
    ) -> InstanceId {
        let id = self.allocate_id();
        let instance = ObservedInstance {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            state: state.to_string(),
            labels,
        };
        self.containers.lock().await.insert(id.clone(), instance);
        id
    }

    /// Current containers, ordered by ID
    pub async fn instances(&self) -> Vec<ObservedInstance> {
        self.containers.lock().await.values().cloned().collect()
    }

    /// Containers whose `label` equals `value`
    pub async fn instances_labelled(&self, label: &str, value: &str) -> Vec<ObservedInstance> {
        self.containers
            .lock()
            .await
            .values()
            .filter(|c| c.label(label) == Some(value))
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> OperationCounts {
        OperationCounts {
            creates: self.creates.load(Ordering::SeqCst),
            starts: self.starts.load(Ordering::SeqCst),
            removes: self.removes.load(Ordering::SeqCst),
        }
    }

    pub fn fail_list(&self, fail: bool) {
        self.faults.list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.faults.create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.faults.start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.faults.remove.store(fail, Ordering::SeqCst);
    }

    /// Deliver an event to every live subscriber
    pub async fn emit(&self, event: RuntimeEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            if tx.try_send(event.clone()).is_err() {
                debug!(action = %event.action, "Event subscriber lagging, dropping event");
            }
        }
    }

    fn allocate_id(&self) -> InstanceId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        InstanceId::new(format!("{:064x}", n + 1))
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn list_all(&self) -> Result<Vec<ObservedInstance>, RuntimeError> {
        if self.faults.list.load(Ordering::SeqCst) {
            return Err(RuntimeError::Injected("list".to_string()));
        }
        Ok(self.instances().await)
    }

    async fn create(
        &self,
        image: &str,
        labels: &HashMap<String, String>,
        name: &str,
    ) -> Result<InstanceId, RuntimeError> {
        if self.faults.create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Injected(format!("create {}", name)));
        }

        let mut containers = self.containers.lock().await;
        if containers.values().any(|c| c.name == name) {
            return Err(RuntimeError::NameConflict(name.to_string()));
        }

        let id = self.allocate_id();
        containers.insert(
            id.clone(),
            ObservedInstance {
                id: id.clone(),
                name: name.to_string(),
                image: image.to_string(),
                state: "created".to_string(),
                labels: labels.clone(),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start(&self, id: &InstanceId) -> Result<(), RuntimeError> {
        if self.faults.start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Injected(format!("start {}", id)));
        }

        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.clone()))?;
        container.state = "running".to_string();
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, id: &InstanceId, force: bool) -> Result<(), RuntimeError> {
        if self.faults.remove.load(Ordering::SeqCst) {
            return Err(RuntimeError::Injected(format!("remove {}", id)));
        }

        {
            let mut containers = self.containers.lock().await;
            let container = containers
                .get(id)
                .ok_or_else(|| RuntimeError::NotFound(id.clone()))?;
            if container.state == "running" && !force {
                return Err(RuntimeError::CommandFailed {
                    command: "remove".to_string(),
                    stderr: format!("container {} is running", id.short()),
                });
            }
            containers.remove(id);
        }
        self.removes.fetch_add(1, Ordering::SeqCst);

        self.emit(RuntimeEvent {
            kind: ObjectKind::Container,
            action: "destroy".to_string(),
            object_id: id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<EventSubscription, RuntimeError> {
        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
        // Never fails, so the error sender can be dropped straight away
        let (_, errors) = mpsc::channel(1);
        self.subscribers.lock().await.push(event_tx);
        Ok(EventSubscription { events, errors })
    }
}

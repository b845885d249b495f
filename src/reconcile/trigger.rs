//! Trigger merger
//!
//! Every reason to reconcile (a store mutation, a container destroyed behind
//! our back, the resync timer) fires the same single-slot signal. Signals
//! that arrive while a wakeup is already pending collapse into it, so the
//! engine runs at most one extra cycle no matter how many events piled up.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::runtime::{ContainerRuntime, EventSubscription};

/// Cloneable handle that requests a reconcile cycle
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    /// Request a wakeup without blocking.
    ///
    /// Returns `false` when a wakeup was already pending and this one
    /// collapsed into it.
    pub fn fire(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => false,
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!("Trigger fired after the reconcile loop went away");
                false
            }
        }
    }
}

/// Receiving side: the engine's only suspension point while idle
pub struct TriggerMerger {
    trigger: Trigger,
    rx: mpsc::Receiver<()>,
    producers: Vec<JoinHandle<()>>,
}

impl TriggerMerger {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            trigger: Trigger { tx },
            rx,
            producers: Vec::new(),
        }
    }

    /// A new handle feeding this merger
    pub fn trigger(&self) -> Trigger {
        self.trigger.clone()
    }

    /// Wait for the next wakeup.
    ///
    /// The merger keeps a sender of its own, so the channel never closes and
    /// this only returns on a real signal.
    pub async fn wait(&mut self) {
        let _ = self.rx.recv().await;
    }

    /// Forward container destroy events from the runtime.
    ///
    /// The subscription is re-established `resubscribe` after it ends or
    /// fails to start. Runtime errors are logged and never stop the loop.
    pub fn watch_runtime(&mut self, runtime: Arc<dyn ContainerRuntime>, resubscribe: Duration) {
        let trigger = self.trigger();
        self.producers.push(tokio::spawn(async move {
            loop {
                match runtime.subscribe_events().await {
                    Ok(subscription) => {
                        info!("Subscribed to runtime destroy events");
                        forward_events(subscription, &trigger).await;
                        warn!(
                            retry_secs = resubscribe.as_secs(),
                            "Runtime event stream ended"
                        );
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            retry_secs = resubscribe.as_secs(),
                            "Failed to subscribe to runtime events"
                        );
                    }
                }
                tokio::time::sleep(resubscribe).await;
            }
        }));
    }

    /// Fire on a fixed period, so a failed cycle is retried even when
    /// nothing else happens. The first tick fires one period from now.
    pub fn watch_interval(&mut self, period: Duration) {
        let trigger = self.trigger();
        self.producers.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if trigger.fire() {
                    debug!("Periodic resync");
                }
            }
        }));
    }
}

impl Default for TriggerMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TriggerMerger {
    fn drop(&mut self) {
        for producer in &self.producers {
            producer.abort();
        }
    }
}

/// Drain one subscription until its event stream closes
async fn forward_events(subscription: EventSubscription, trigger: &Trigger) {
    let EventSubscription {
        mut events,
        mut errors,
    } = subscription;
    let mut errors_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) if event.is_container_destroy() => {
                    info!(container = %event.object_id, "Container destroyed");
                    trigger.fire();
                }
                Some(event) => {
                    debug!(kind = ?event.kind, action = %event.action, "Ignoring runtime event");
                }
                None => break,
            },
            err = errors.recv(), if errors_open => match err {
                Some(e) => error!(error = %e, "Runtime error"),
                None => errors_open = false,
            },
        }
    }
}

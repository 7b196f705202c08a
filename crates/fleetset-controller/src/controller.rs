//! Controller — watches the store and drives reconciles through the queue.
//!
//! The `Controller` turns store change events into machine-set keys, feeds
//! them to a [`WorkQueue`], and runs a fixed pool of workers that reconcile
//! one key at a time. A periodic resync enqueues every set so time-based
//! state (availability) and missed events are eventually picked up.
//!
//! # Architecture
//!
//! ```text
//! Controller
//!   ├── broadcast::Receiver<StoreEvent> (change feed)
//!   │     ├── MachineSet event → its own key
//!   │     ├── Machine event    → controller owner, or selector matches
//!   │     └── Node event       → owners of machines on that node
//!   ├── WorkQueue<ObjectKey> (dedup + backoff)
//!   └── N workers → Reconciler::reconcile → Action
//! ```

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleetset_state::{MACHINE_SET_KIND, Machine, ObjectKey, StoreEvent};

use crate::client::FleetClient;
use crate::config::ControllerConfig;
use crate::mapper::map_unit_to_sets;
use crate::queue::WorkQueue;
use crate::reconciler::{Action, Reconciler};

pub struct Controller<C> {
    reconciler: Reconciler<C>,
    queue: WorkQueue<ObjectKey>,
    events: broadcast::Receiver<StoreEvent>,
}

impl<C: FleetClient + 'static> Controller<C> {
    /// Create a controller reading changes from `events`, typically
    /// obtained from `StateStore::subscribe` before the first write.
    pub fn new(
        client: Arc<C>,
        events: broadcast::Receiver<StoreEvent>,
        config: ControllerConfig,
    ) -> Self {
        let queue = WorkQueue::new(config.backoff_base(), config.backoff_max());
        Self {
            reconciler: Reconciler::new(client, config),
            queue,
            events,
        }
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Run until `shutdown` flips or the change feed closes.
    ///
    /// Workers finish the key they hold before this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let config = self.reconciler.config().clone();
        info!(workers = config.workers, "controller starting");

        self.resync().await;

        let workers: Vec<JoinHandle<()>> = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    self.reconciler.clone(),
                    self.queue.clone(),
                ))
            })
            .collect();

        let mut resync = tokio::time::interval(config.resync_interval());
        // The first tick completes immediately; the initial resync already ran.
        resync.tick().await;

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(event) => self.handle_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change feed lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        info!("change feed closed");
                        break;
                    }
                },
                _ = resync.tick() => self.resync().await,
                _ = shutdown.changed() => {
                    info!("controller shutting down");
                    break;
                }
            }
        }

        self.queue.shutdown();
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("controller stopped");
    }

    async fn handle_event(&self, event: &StoreEvent) {
        for key in self.keys_for_event(event).await {
            self.queue.add(key);
        }
    }

    /// Machine-set keys affected by `event`.
    pub(crate) async fn keys_for_event(&self, event: &StoreEvent) -> Vec<ObjectKey> {
        let client = self.reconciler.client();
        match event {
            StoreEvent::MachineSet { object, .. } => vec![object.metadata.key()],
            StoreEvent::Machine { object, .. } => {
                if let Some(owner) = owner_key(object) {
                    return vec![owner];
                }
                match map_unit_to_sets(client, object).await {
                    Ok(mapping) => mapping.into_keys(),
                    Err(e) => {
                        warn!(machine = %object.metadata.key(), error = %e, "failed to map machine to sets");
                        Vec::new()
                    }
                }
            }
            StoreEvent::Node { object, .. } => match client.list_machines(None).await {
                Ok(machines) => machines
                    .iter()
                    .filter(|m| {
                        m.status
                            .node_ref
                            .as_ref()
                            .is_some_and(|r| r.name == object.metadata.name)
                    })
                    .filter_map(owner_key)
                    .collect(),
                Err(e) => {
                    warn!(node = %object.metadata.name, error = %e, "failed to map node to sets");
                    Vec::new()
                }
            },
        }
    }

    /// Enqueue every machine set.
    async fn resync(&self) {
        match self.reconciler.client().list_machine_sets(None).await {
            Ok(sets) => {
                debug!(count = sets.len(), "resync");
                for set in sets {
                    self.queue.add(set.metadata.key());
                }
            }
            Err(e) => error!(error = %e, "resync failed"),
        }
    }
}

/// Key of the machine set controlling `machine`, if any.
fn owner_key(machine: &Machine) -> Option<ObjectKey> {
    machine
        .metadata
        .controller_ref()
        .filter(|owner| owner.kind == MACHINE_SET_KIND)
        .map(|owner| ObjectKey::new(machine.metadata.namespace.clone(), owner.name.clone()))
}

async fn run_worker<C: FleetClient + 'static>(
    id: usize,
    reconciler: Reconciler<C>,
    queue: WorkQueue<ObjectKey>,
) {
    debug!(worker = id, "worker starting");
    while let Some(key) = queue.get().await {
        let action = match reconciler.reconcile(&key).await {
            Ok(action) => action,
            Err(e) => reconciler.error_policy(&key, &e),
        };
        match action {
            Action::Done | Action::AwaitChange => queue.forget(&key),
            Action::Requeue(delay) => {
                queue.forget(&key);
                debug!(set = %key, ?delay, "requeueing");
                queue.requeue_after(key.clone(), delay);
            }
            Action::Backoff => {
                let delay = queue.requeue_rate_limited(key.clone());
                debug!(set = %key, ?delay, failures = queue.failures(&key), "backing off");
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

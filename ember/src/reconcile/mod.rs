//! Reconciliation machinery: a keyed work queue and a fixed worker pool.
//!
//! Events from the REST handlers and the periodic resync land on the queue
//! as `(namespace, name)` keys. At most one worker processes a given key
//! at any moment, so all mutations to a single resource serialize;
//! independent keys proceed in parallel. A key enqueued while its worker
//! is mid-reconcile is retried shortly after.

pub mod deployment;
pub mod runner;

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::configuration::VmSettings;
use crate::lifecycle::{RuntimeDriver, VmLifecycleManager};
use crate::model::runners::RuntimeKind;
use crate::model::{runner_deployments, runners};

/// Resync cadence; the safety net behind event-driven reconciles.
const RESYNC_PERIOD: Duration = Duration::from_secs(120);

/// Backoff when a reconcile returns an error the resource state does not
/// capture (database failures and the like).
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Delay before retrying a key that was busy when popped.
const BUSY_REQUEUE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum Key {
    Deployment { namespace: String, name: String },
    Runner { namespace: String, name: String },
}

struct QueueState {
    pending: HashSet<Key>,
    active: HashSet<Key>,
}

/// Deduplicating, keyed work queue. Cloneable handle.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<Key>,
    state: Arc<StdMutex<QueueState>>,
}

impl WorkQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Key>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                state: Arc::new(StdMutex::new(QueueState {
                    pending: HashSet::new(),
                    active: HashSet::new(),
                })),
            },
            rx,
        )
    }

    /// Add a key; a key already pending is not duplicated.
    pub fn enqueue(&self, key: Key) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.pending.insert(key.clone()) {
            // Receiver dropped only at shutdown.
            let _ = self.tx.send(key);
        }
    }

    pub fn enqueue_after(&self, key: Key, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Claim a key for processing. Returns false when another worker holds
    /// it; the caller should requeue.
    fn begin(&self, key: &Key) -> bool {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.pending.remove(key);
        state.active.insert(key.clone())
    }

    fn finish(&self, key: &Key) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.active.remove(key);
    }
}

/// Everything a reconcile invocation needs.
pub struct ReconcileContext {
    pub pool: Arc<PgPool>,
    pub firecracker: Arc<VmLifecycleManager>,
    pub queue: WorkQueue,
    pub settings: VmSettings,
}

impl ReconcileContext {
    /// Single dispatch point from the runtime tag to a driver. Container
    /// runners belong to the container controller and get no driver here;
    /// the same applies to every runner when the firecracker gate is off.
    pub fn driver_for(&self, runtime: RuntimeKind) -> Option<&dyn RuntimeDriver> {
        match runtime {
            RuntimeKind::Firecracker if self.settings.enable_firecracker => {
                Some(self.firecracker.as_ref())
            }
            _ => None,
        }
    }
}

/// Run the worker pool and the resync ticker until shutdown fires.
pub async fn run(
    ctx: Arc<ReconcileContext>,
    rx: mpsc::UnboundedReceiver<Key>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) {
    info!("starting {} reconcile worker(s)", workers);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let mut handles = Vec::new();
    for worker_id in 0..workers {
        let ctx = ctx.clone();
        let rx = rx.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(worker_loop(worker_id, ctx, rx, shutdown)));
    }
    handles.push(tokio::spawn(resync_loop(ctx, shutdown)));

    for handle in handles {
        let _ = handle.await;
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<ReconcileContext>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Key>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let key = tokio::select! {
            _ = shutdown.changed() => break,
            key = async { rx.lock().await.recv().await } => match key {
                Some(key) => key,
                None => break,
            },
        };

        if !ctx.queue.begin(&key) {
            ctx.queue.enqueue_after(key, BUSY_REQUEUE);
            continue;
        }

        debug!(worker = worker_id, key = ?key, "reconciling");
        let result = match &key {
            Key::Runner { namespace, name } => runner::reconcile(&ctx, namespace, name).await,
            Key::Deployment { namespace, name } => {
                deployment::reconcile(&ctx, namespace, name).await
            }
        };

        if let Err(e) = result {
            warn!(key = ?key, "reconcile failed, requeueing: {:#}", e);
            ctx.queue.enqueue_after(key.clone(), ERROR_REQUEUE);
        }
        ctx.queue.finish(&key);
    }
    debug!(worker = worker_id, "reconcile worker stopped");
}

/// Enqueue every known resource on a fixed period.
async fn resync_loop(ctx: Arc<ReconcileContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(RESYNC_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match runner_deployments::list_keys(&ctx.pool).await {
            Ok(keys) => {
                for (namespace, name) in keys {
                    ctx.queue.enqueue(Key::Deployment { namespace, name });
                }
            }
            Err(e) => warn!("resync: failed to list deployments: {}", e),
        }

        match runners::list_keys(&ctx.pool).await {
            Ok(keys) => {
                for (namespace, name) in keys {
                    ctx.queue.enqueue(Key::Runner { namespace, name });
                }
            }
            Err(e) => warn!("resync: failed to list runners: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_deduplicates_pending_keys() {
        let (queue, mut rx) = WorkQueue::new();
        let key = Key::Runner {
            namespace: "default".to_string(),
            name: "r1".to_string(),
        };

        queue.enqueue(key.clone());
        queue.enqueue(key.clone());
        queue.enqueue(key.clone());

        assert_eq!(rx.recv().await, Some(key));
        assert!(rx.try_recv().is_err(), "duplicates must collapse");
    }

    #[tokio::test]
    async fn a_claimed_key_cannot_be_claimed_twice() {
        let (queue, _rx) = WorkQueue::new();
        let key = Key::Deployment {
            namespace: "default".to_string(),
            name: "d1".to_string(),
        };

        assert!(queue.begin(&key));
        assert!(!queue.begin(&key), "second claim must fail while active");
        queue.finish(&key);
        assert!(queue.begin(&key), "claim succeeds again after finish");
    }

    #[tokio::test]
    async fn a_key_can_be_reenqueued_after_claim() {
        let (queue, mut rx) = WorkQueue::new();
        let key = Key::Runner {
            namespace: "default".to_string(),
            name: "r1".to_string(),
        };

        queue.enqueue(key.clone());
        assert_eq!(rx.recv().await, Some(key.clone()));
        assert!(queue.begin(&key));

        // An event arriving mid-reconcile queues the key again.
        queue.enqueue(key.clone());
        assert_eq!(rx.recv().await, Some(key));
    }
}

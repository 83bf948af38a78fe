use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer::{Strategy, StrategyFactory};
use crate::model::BackendInstance;

/// Healthy backends plus the strategy bound to one service
#[derive(Clone)]
pub struct SubPool {
    backends: Vec<Arc<BackendInstance>>,
    strategy: Arc<dyn Strategy>,
}

type Snapshot = HashMap<String, SubPool>;

/// Lock-free read view of the healthy fleet.
///
/// The whole per-service map is copy-on-write: every update clones it,
/// rebuilds the touched sub-pool and publishes the result with an atomic
/// pointer swap. Readers load the pointer once per request and never see a
/// partially updated map. Reads dominate writes by orders of magnitude,
/// which is why this wins over per-service locks.
pub struct ServerPool {
    snapshot: ArcSwap<Snapshot>,
    // Serializes snapshot construction; publication stays atomic.
    rebuild: Mutex<()>,
    strategy_factory: StrategyFactory,
    shutdown_tx: broadcast::Sender<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ServerPool {
    /// Build the pool and start consuming the registry's update channel.
    pub fn new(
        update_rx: mpsc::Receiver<Arc<BackendInstance>>,
        strategy_factory: StrategyFactory,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(4);

        let pool = Arc::new(Self {
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
            rebuild: Mutex::new(()),
            strategy_factory,
            shutdown_tx,
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let handle = Arc::clone(&pool).spawn_listener(update_rx);
        *pool.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        pool
    }

    fn spawn_listener(
        self: Arc<Self>,
        mut update_rx: mpsc::Receiver<Arc<BackendInstance>>,
    ) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    update = update_rx.recv() => {
                        // A closed channel means the registry is gone.
                        let Some(instance) = update else { return };
                        self.apply_update(&instance);
                    }
                }
            }
        })
    }

    /// Fold one published instance state into a fresh snapshot.
    ///
    /// The previous backend list is rebuilt: a matching entry is replaced
    /// and kept only while healthy, a new healthy instance is appended, an
    /// unhealthy one is dropped.
    pub fn apply_update(&self, instance: &Arc<BackendInstance>) {
        let _guard = self.rebuild.lock().unwrap_or_else(|e| e.into_inner());

        let current = self.snapshot.load();
        let mut next: Snapshot = (**current).clone();

        let service = instance.service_name().to_string();
        let (strategy, old_backends) = match next.get(&service) {
            Some(sub) => (Arc::clone(&sub.strategy), sub.backends.clone()),
            None => ((self.strategy_factory)(&service), Vec::new()),
        };

        let mut backends = Vec::with_capacity(old_backends.len() + 1);
        let mut found = false;

        for existing in old_backends {
            if existing.id() == instance.id() {
                found = true;
                if instance.is_healthy() {
                    backends.push(Arc::clone(instance));
                }
            } else {
                backends.push(existing);
            }
        }

        if !found && instance.is_healthy() {
            backends.push(Arc::clone(instance));
        }

        debug!(
            service = %service,
            instance = %instance.id(),
            healthy = instance.is_healthy(),
            total_healthy = backends.len(),
            "Server pool updated"
        );

        next.insert(
            service,
            SubPool {
                backends,
                strategy,
            },
        );

        self.snapshot.store(Arc::new(next));
    }

    /// Pick a backend for `service` with its bound strategy. Lock-free.
    pub fn pick(&self, service: &str, client_ip: &str) -> Option<Arc<BackendInstance>> {
        let snapshot = self.snapshot.load();

        let sub = match snapshot.get(service) {
            Some(sub) if !sub.backends.is_empty() => sub,
            _ => {
                warn!(service = %service, "No healthy servers for service");
                return None;
            }
        };

        sub.strategy.pick(&sub.backends, client_ip)
    }

    /// Fetch a specific healthy instance from the snapshot. Lock-free.
    pub fn get_instance(&self, service: &str, instance_id: &str) -> Option<Arc<BackendInstance>> {
        let snapshot = self.snapshot.load();
        let sub = snapshot.get(service)?;

        sub.backends
            .iter()
            .find(|b| b.id() == instance_id)
            .filter(|b| b.is_healthy())
            .cloned()
    }

    /// Healthy backend count for a service, for observability and tests
    pub fn healthy_len(&self, service: &str) -> usize {
        self.snapshot
            .load()
            .get(service)
            .map(|sub| sub.backends.len())
            .unwrap_or(0)
    }

    /// Stop the update listener. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Closing server pool");
        let _ = self.shutdown_tx.send(());

        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

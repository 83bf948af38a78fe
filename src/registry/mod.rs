//! Authoritative in-memory map of `(service, instance)` with lifecycle,
//! TTL eviction and one health worker per service.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ShoalError, ShoalResult};
use crate::model::{BackendInstance, RegistrationInput};
use crate::resilience::{CircuitBreaker, ExponentialRetry, ResilientTransport};

pub use worker::MAX_BATCH_SIZE;

/// Hard cap on instances per service bucket
pub const MAX_INSTANCES_PER_SERVICE: usize = 64;
/// Update-channel capacity; a full channel back-pressures registry writers
const UPDATE_CHANNEL_CAPACITY: usize = 64;
/// Cadence of the TTL sweeper
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Default health-check tick per service worker
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) struct WorkerState {
    pub(crate) last_index: usize,
    handle: JoinHandle<()>,
}

pub(crate) struct RegistryInner {
    pub(crate) services: RwLock<HashMap<String, HashMap<String, Arc<BackendInstance>>>>,
    // Lock order: services.write is taken before workers.
    pub(crate) workers: Mutex<HashMap<String, WorkerState>>,
    update_tx: mpsc::Sender<Arc<BackendInstance>>,
    update_rx: Mutex<Option<mpsc::Receiver<Arc<BackendInstance>>>>,
    pub(crate) check_interval: Duration,
    max_instances: usize,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// The registry owns every instance record and is the only writer of
/// instance health. Health transitions and membership changes are published
/// on the update channel the server pool consumes.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(check_interval: Option<Duration>) -> Self {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(8);

        Self {
            inner: Arc::new(RegistryInner {
                services: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                update_tx,
                update_rx: Mutex::new(Some(update_rx)),
                check_interval: check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL),
                max_instances: MAX_INSTANCES_PER_SERVICE,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Hand out the consumer end of the update channel.
    ///
    /// There is exactly one consumer (the server pool); a second call
    /// returns `None`.
    pub fn take_update_receiver(&self) -> Option<mpsc::Receiver<Arc<BackendInstance>>> {
        self.inner
            .update_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Start the registration gate and the TTL sweeper.
    pub fn start(&self, registration_rx: mpsc::Receiver<RegistrationInput>) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let gate = self.spawn_registration_gate(registration_rx);
        let sweeper = self.spawn_ttl_sweeper();

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(gate);
        tasks.push(sweeper);

        info!("Registry started");
    }

    /// Stop every background loop and wait for them to drain. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Stopping registry");
        let _ = self.inner.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        let workers: Vec<(String, WorkerState)> = {
            let mut guard = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain().collect()
        };
        for (_, state) in workers {
            let _ = state.handle.await;
        }

        info!("Registry stopped");
    }

    /// Register an instance.
    ///
    /// Installs a default resilient transport when the record arrives
    /// without one, rejects a full bucket, marks the instance healthy with
    /// a fresh heartbeat, publishes it for the pool and makes sure a health
    /// worker exists for the service.
    pub async fn register(&self, instance: Arc<BackendInstance>) -> ShoalResult<()> {
        if instance.id().is_empty() || instance.service_name().is_empty() {
            return Err(ShoalError::invalid_instance("empty instance or service id"));
        }
        if instance.host().is_empty() {
            return Err(ShoalError::invalid_instance("empty host"));
        }
        if instance.port() == 0 {
            return Err(ShoalError::invalid_instance("port must be positive"));
        }

        if !instance.has_transport() {
            instance.set_transport(default_transport(
                instance.service_name(),
                instance.id(),
            ));
            warn!(
                service = %instance.service_name(),
                instance = %instance.id(),
                "Fallback resilient transport installed for instance"
            );
        }

        let service = instance.service_name().to_string();

        {
            let mut services = self.inner.services.write().await;
            let bucket = services.entry(service.clone()).or_default();

            if bucket.len() >= self.inner.max_instances
                && !bucket.contains_key(instance.id())
            {
                warn!(
                    service = %service,
                    max_allowed = self.inner.max_instances,
                    current = bucket.len(),
                    "Cannot register new instance: max instances reached"
                );
                return Err(ShoalError::capacity(service, self.inner.max_instances));
            }

            instance.set_alive(true);
            bucket.insert(instance.id().to_string(), Arc::clone(&instance));

            // A full channel intentionally back-pressures the writer here.
            if self.inner.update_tx.send(Arc::clone(&instance)).await.is_err() {
                debug!("Update channel closed, pool is gone");
            }
        }

        self.ensure_worker(&service);

        info!(service = %service, instance = %instance.id(), "Instance registered");
        Ok(())
    }

    /// Build a record from a control-plane registration and register it.
    pub async fn register_input(&self, input: RegistrationInput) -> ShoalResult<()> {
        self.register(Arc::new(BackendInstance::from_input(input))).await
    }

    /// Remove an instance; the published record is marked unhealthy so the
    /// pool drops it. An empty bucket takes its worker down with it.
    pub async fn deregister(&self, service: &str, instance_id: &str) -> ShoalResult<()> {
        let removed = {
            let mut services = self.inner.services.write().await;
            let bucket = services.get_mut(service);

            let Some(bucket) = bucket else {
                return Err(ShoalError::invalid_instance(format!(
                    "instance {}/{} not found",
                    service, instance_id
                )));
            };

            let Some(instance) = bucket.remove(instance_id) else {
                return Err(ShoalError::invalid_instance(format!(
                    "instance {}/{} not found",
                    service, instance_id
                )));
            };

            instance.set_alive(false);
            if self.inner.update_tx.send(Arc::clone(&instance)).await.is_err() {
                debug!("Update channel closed, pool is gone");
            }

            if bucket.is_empty() {
                services.remove(service);
                true
            } else {
                false
            }
        };

        if removed {
            self.inner.remove_worker(service);
        }

        info!(service = %service, instance = %instance_id, "Instance deregistered");
        Ok(())
    }

    /// Apply a probed health state to the live record.
    ///
    /// Publishes on the update channel only when the boolean actually
    /// changed; the pool treats every publish as a rebuild trigger.
    pub async fn update_status(&self, instance: &Arc<BackendInstance>, alive: bool) {
        self.inner.update_status(instance, alive).await;
    }

    /// Snapshot of the healthy instances for a service.
    pub async fn discover(&self, service: &str) -> ShoalResult<Vec<Arc<BackendInstance>>> {
        let services = self.inner.services.read().await;

        let bucket = services
            .get(service)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ShoalError::no_servers(service))?;

        let healthy: Vec<Arc<BackendInstance>> = bucket
            .values()
            .filter(|i| i.is_healthy())
            .cloned()
            .collect();

        if healthy.is_empty() {
            return Err(ShoalError::no_healthy(service));
        }

        Ok(healthy)
    }

    /// Number of registered instances for a service (all health states)
    pub async fn service_len(&self, service: &str) -> usize {
        let services = self.inner.services.read().await;
        services.get(service).map(|b| b.len()).unwrap_or(0)
    }

    pub fn has_worker(&self, service: &str) -> bool {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(service)
    }

    fn ensure_worker(&self, service: &str) {
        let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.contains_key(service) {
            return;
        }

        let handle = worker::spawn_worker(Arc::clone(&self.inner), service.to_string());
        workers.insert(
            service.to_string(),
            WorkerState {
                last_index: 0,
                handle,
            },
        );

        info!(service = %service, "Created health worker for service");
    }

    fn spawn_registration_gate(
        &self,
        mut registration_rx: mpsc::Receiver<RegistrationInput>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    input = registration_rx.recv() => {
                        let Some(input) = input else { return };
                        let service = input.service_name.clone();
                        let id = input.instance_id.clone();
                        if let Err(e) = registry.register_input(input).await {
                            warn!(service = %service, instance = %id, error = %e, "Registration rejected");
                        }
                    }
                }
            }
        })
    }

    fn spawn_ttl_sweeper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = ticker.tick() => registry.sweep_expired().await,
                }
            }
        })
    }

    /// Evict every instance whose heartbeat is older than its TTL.
    pub async fn sweep_expired(&self) {
        self.sweep_expired_at(Instant::now()).await;
    }

    async fn sweep_expired_at(&self, now: Instant) {
        let mut services = self.inner.services.write().await;

        services.retain(|service, bucket| {
            bucket.retain(|id, instance| {
                let expired = instance.is_expired(now);
                if expired {
                    info!(service = %service, instance = %id, "Evicting expired instance");
                }
                !expired
            });
            !bucket.is_empty()
        });
    }
}

impl RegistryInner {
    pub(crate) async fn update_status(&self, instance: &Arc<BackendInstance>, alive: bool) {
        let services = self.services.write().await;

        let Some(existing) = services
            .get(instance.service_name())
            .and_then(|bucket| bucket.get(instance.id()))
        else {
            return;
        };

        let was_healthy = existing.is_healthy();
        if was_healthy == alive {
            return;
        }

        existing.set_alive(alive);
        let record = Arc::clone(existing);
        drop(services);

        debug!(
            service = %instance.service_name(),
            instance = %instance.id(),
            from = was_healthy,
            to = alive,
            "Health state changed"
        );

        if self.update_tx.send(record).await.is_err() {
            debug!("Update channel closed, pool is gone");
        }
    }

    pub(crate) fn remove_worker(&self, service: &str) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.remove(service).is_some() {
            info!(service = %service, "Removed health worker for empty service");
        }
    }
}

fn default_transport(service: &str, instance_id: &str) -> Arc<ResilientTransport> {
    let breaker = Arc::new(CircuitBreaker::with_defaults(format!(
        "cb-{}-{}",
        service, instance_id
    )));
    Arc::new(ResilientTransport::new(
        breaker,
        ExponentialRetry::with_defaults(),
    ))
}

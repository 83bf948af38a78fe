use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::health::HealthChecker;
use crate::model::BackendInstance;
use crate::registry::RegistryInner;

/// Instances probed per worker tick
pub const MAX_BATCH_SIZE: usize = 16;
/// Batches a single worker may have in flight
const MAX_CONCURRENT_BATCHES: usize = 5;

/// Run one health worker for `service` until shutdown or the bucket empties.
///
/// Each tick extracts a batch by rotating a cursor through the instance
/// list, then runs the probes on a detached task gated by a semaphore so a
/// slow batch never blocks the tick. Transitions re-enter the registry
/// through `update_status`.
pub(crate) fn spawn_worker(inner: Arc<RegistryInner>, service: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let checker = HealthChecker::new();
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_BATCHES));
        let mut shutdown = inner.shutdown_tx.subscribe();

        let start = tokio::time::Instant::now() + inner.check_interval;
        let mut ticker = tokio::time::interval_at(start, inner.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {
                    let batch = extract_batch(&inner, &service).await;
                    if batch.is_empty() {
                        info!(service = %service, "Worker stopped: service empty");
                        inner.remove_worker(&service);
                        return;
                    }

                    let permit = match Arc::clone(&semaphore).acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return,
                    };

                    let checker = checker.clone();
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let transitions = checker.check_batch(batch).await;
                        for (instance, alive) in transitions {
                            inner.update_status(&instance, alive).await;
                        }
                    });
                }
            }
        }
    })
}

/// Take up to `MAX_BATCH_SIZE` instances starting at the worker's cursor,
/// wrapping around, and advance the cursor.
async fn extract_batch(inner: &Arc<RegistryInner>, service: &str) -> Vec<Arc<BackendInstance>> {
    let all: Vec<Arc<BackendInstance>> = {
        let services = inner.services.read().await;
        match services.get(service) {
            Some(bucket) if !bucket.is_empty() => {
                let mut list: Vec<Arc<BackendInstance>> = bucket.values().cloned().collect();
                // Stable order so the cursor rotates over a consistent list.
                list.sort_by(|a, b| a.id().cmp(b.id()));
                list
            }
            _ => return Vec::new(),
        }
    };

    let mut workers = inner.workers.lock().unwrap_or_else(|e| e.into_inner());
    let Some(state) = workers.get_mut(service) else {
        return Vec::new();
    };

    let mut start = state.last_index;
    if start >= all.len() {
        start = 0;
    }
    let end = (start + MAX_BATCH_SIZE).min(all.len());
    state.last_index = end % all.len();

    debug!(
        service,
        start,
        end,
        total = all.len(),
        "Extracted health-check batch"
    );

    all[start..end].to_vec()
}

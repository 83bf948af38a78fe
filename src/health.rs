use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::model::BackendInstance;

/// Probes allowed in flight per batch
const MAX_CONCURRENT_PROBES: usize = 5;
/// Per-probe timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Probes a batch of instances and reports health transitions.
///
/// A probe is a GET against the instance root; the instance is alive when
/// the request completes with a status below 500. The checker never mutates
/// instance state itself: transitions are returned so the registry applies
/// them through `update_status`.
#[derive(Clone)]
pub struct HealthChecker {
    client: Client,
}

impl HealthChecker {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();

        Self { client }
    }

    /// Probe every instance in `batch` with bounded concurrency.
    ///
    /// Waits for all probes, then returns the `(instance, alive)` pairs
    /// whose probed state differs from the instance's current health.
    pub async fn check_batch(
        &self,
        batch: Vec<Arc<BackendInstance>>,
    ) -> Vec<(Arc<BackendInstance>, bool)> {
        if batch.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
        let mut handles = Vec::with_capacity(batch.len());

        for instance in batch {
            let semaphore = Arc::clone(&semaphore);
            let client = self.client.clone();
            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(p) => p,
                    Err(_) => return None,
                };

                let alive = ping(&client, &instance.addr()).await;
                let changed = alive != instance.is_healthy();

                if changed {
                    debug!(
                        service = %instance.service_name(),
                        instance = %instance.id(),
                        alive,
                        "Health state transition observed"
                    );
                    Some((instance, alive))
                } else {
                    None
                }
            }));
        }

        let mut transitions = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Some(transition)) => transitions.push(transition),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Health probe task failed"),
            }
        }

        transitions
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

async fn ping(client: &Client, addr: &str) -> bool {
    match client.get(addr).send().await {
        Ok(response) => {
            let status = response.status();
            if status.as_u16() < 500 {
                debug!(addr, status = status.as_u16(), "Health check OK");
                true
            } else {
                warn!(addr, status = status.as_u16(), "Backend responded with server error");
                false
            }
        }
        Err(e) => {
            warn!(addr, error = %e, "Backend is down");
            false
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::error::{ShoalError, ShoalResult};
use crate::model::BackendInstance;

/// Picks one backend from a healthy list for a client
pub trait Strategy: Send + Sync {
    fn pick(
        &self,
        backends: &[Arc<BackendInstance>],
        client_ip: &str,
    ) -> Option<Arc<BackendInstance>>;
}

/// Builds one strategy per service, on first sight of the service
pub type StrategyFactory = Arc<dyn Fn(&str) -> Arc<dyn Strategy> + Send + Sync>;

/// Map a configured strategy name to a per-service factory.
///
/// `weight_round_robin` is accepted as a synonym of `round_robin`.
pub fn strategy_factory(name: &str) -> ShoalResult<StrategyFactory> {
    match name {
        "round_robin" | "weight_round_robin" => Ok(Arc::new(|service: &str| {
            info!(service = %service, "Creating weighted round-robin strategy");
            Arc::new(WeightedRoundRobin::new()) as Arc<dyn Strategy>
        })),
        "least_conn" => Ok(Arc::new(|service: &str| {
            info!(service = %service, "Creating weighted least-connections strategy");
            Arc::new(WeightedLeastConnections) as Arc<dyn Strategy>
        })),
        "ip_hash" => Ok(Arc::new(|service: &str| {
            info!(service = %service, "Creating IP-hash strategy");
            Arc::new(IpHash) as Arc<dyn Strategy>
        })),
        other => Err(ShoalError::config(format!(
            "invalid strategy: {}. Supported: [round_robin, least_conn, ip_hash]",
            other
        ))),
    }
}

/// Smooth weighted round-robin.
///
/// Each pick adds every instance's effective weight to its running current
/// weight, selects the maximum (first wins on ties) and subtracts the total
/// weight from the winner. The current weights persist across calls, keyed
/// by instance id and pruned to the supplied list, which is what produces
/// the interleaved sequence instead of runs of the heaviest backend.
pub struct WeightedRoundRobin {
    current_weights: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            current_weights: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for WeightedRoundRobin {
    fn pick(
        &self,
        backends: &[Arc<BackendInstance>],
        _client_ip: &str,
    ) -> Option<Arc<BackendInstance>> {
        if backends.is_empty() {
            return None;
        }

        let healthy: Vec<&Arc<BackendInstance>> =
            backends.iter().filter(|b| b.is_healthy()).collect();
        if healthy.is_empty() {
            return backends.first().cloned();
        }

        let total_weight: i64 = healthy.iter().map(|b| i64::from(b.weight())).sum();

        let mut weights = self
            .current_weights
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        // Drop state for instances no longer in the list.
        weights.retain(|id, _| healthy.iter().any(|b| b.id() == id));

        let mut best: Option<&Arc<BackendInstance>> = None;
        let mut best_weight = i64::MIN;

        for &backend in &healthy {
            let current = weights.entry(backend.id().to_string()).or_insert(0);
            *current += i64::from(backend.weight());

            if *current > best_weight {
                best_weight = *current;
                best = Some(backend);
            }
        }

        let chosen = best?;
        if let Some(current) = weights.get_mut(chosen.id()) {
            *current -= total_weight;
        }

        Some(Arc::clone(chosen))
    }
}

/// Weighted least-connections.
///
/// Scores each healthy instance `active_conns / weight` and picks the
/// minimum; on equal scores the higher weight wins, otherwise the earlier
/// entry is kept.
pub struct WeightedLeastConnections;

impl Strategy for WeightedLeastConnections {
    fn pick(
        &self,
        backends: &[Arc<BackendInstance>],
        _client_ip: &str,
    ) -> Option<Arc<BackendInstance>> {
        if backends.is_empty() {
            return None;
        }

        let mut best: Option<&Arc<BackendInstance>> = None;
        let mut min_score = f64::MAX;

        for backend in backends {
            if !backend.is_healthy() {
                continue;
            }

            let weight = f64::from(backend.weight().max(1));
            let score = backend.active_conns() as f64 / weight;

            if score < min_score {
                min_score = score;
                best = Some(backend);
                continue;
            }

            if let Some(current) = best {
                if score == min_score && backend.weight() > current.weight() {
                    best = Some(backend);
                }
            }
        }

        best.or_else(|| backends.first()).cloned()
    }
}

/// CRC32-based IP affinity.
///
/// Hashes the host part of the client address over the healthy list, so a
/// fixed client and a fixed healthy set always map to the same instance.
pub struct IpHash;

impl Strategy for IpHash {
    fn pick(
        &self,
        backends: &[Arc<BackendInstance>],
        client_ip: &str,
    ) -> Option<Arc<BackendInstance>> {
        if backends.is_empty() {
            return None;
        }

        let ip = extract_ip(client_ip);
        if ip.is_empty() {
            return backends.first().cloned();
        }

        let healthy: Vec<&Arc<BackendInstance>> =
            backends.iter().filter(|b| b.is_healthy()).collect();
        if healthy.is_empty() {
            return backends.first().cloned();
        }

        let hash = crc32fast::hash(ip.as_bytes());
        let index = (hash as usize) % healthy.len();
        Some(Arc::clone(healthy[index]))
    }
}

/// Strip a port suffix and IPv6 brackets from a client address
fn extract_ip(addr: &str) -> String {
    if addr.is_empty() {
        return String::new();
    }

    if let Ok(socket) = addr.parse::<std::net::SocketAddr>() {
        return socket.ip().to_string();
    }

    addr.trim_matches(|c| c == '[' || c == ']').to_string()
}

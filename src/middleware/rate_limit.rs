use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::{debug, info};

/// Non-keyed token bucket; one per client IP
pub type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Cleaner cadence
const CLEAN_INTERVAL: Duration = Duration::from_secs(60);
/// Entries idle longer than this are evicted (3 · CLEAN_INTERVAL)
const IDLE_THRESHOLD: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second
    pub tokens_per_second: u32,
    /// Bucket capacity
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 2,
            burst: 5,
        }
    }
}

struct ClientEntry {
    limiter: DirectRateLimiter,
    last_seen: Instant,
}

/// Per-client-IP token bucket.
///
/// Each IP gets its own bucket of `burst` tokens refilled at
/// `tokens_per_second`. Buckets idle for three cleaner intervals are
/// evicted by the background cleaner.
pub struct IpRateLimiter {
    clients: Mutex<HashMap<IpAddr, ClientEntry>>,
    quota: Quota,
}

impl IpRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let rate = NonZeroU32::new(config.tokens_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);

        Self {
            clients: Mutex::new(HashMap::new()),
            quota: Quota::per_second(rate).allow_burst(burst),
        }
    }

    /// Take one token for `ip`; false means the request must be rejected
    pub fn check(&self, ip: IpAddr) -> bool {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        let entry = clients.entry(ip).or_insert_with(|| ClientEntry {
            limiter: RateLimiter::direct(self.quota),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();

        entry.limiter.check().is_ok()
    }

    /// Spawn the idle-entry cleaner; exits when shutdown fires.
    pub fn start_cleaner(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let limiter = self;
        tokio::spawn(async move {
            info!("Rate limiter cleaner started");
            let mut ticker = tokio::time::interval(CLEAN_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.evict_idle(IDLE_THRESHOLD),
                    _ = shutdown.recv() => {
                        info!("Rate limiter cleaner stopped");
                        return;
                    }
                }
            }
        });
    }

    fn evict_idle(&self, threshold: Duration) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let before = clients.len();
        let now = Instant::now();
        clients.retain(|_, entry| now.duration_since(entry.last_seen) <= threshold);

        let evicted = before - clients.len();
        if evicted > 0 {
            debug!(evicted, remaining = clients.len(), "Evicted idle rate-limit entries");
        }
    }

    /// Tracked client count, for observability and tests
    pub fn tracked_clients(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

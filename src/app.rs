use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::balancer::strategy_factory;
use crate::cache::{MemoryCache, SessionCache};
use crate::config::Config;
use crate::error::{ShoalError, ShoalResult};
use crate::middleware::{IpRateLimiter, RateLimitConfig, StickyManager};
use crate::model::RegistrationInput;
use crate::pool::ServerPool;
use crate::proxy::Pipeline;
use crate::registry::Registry;
use crate::router::PathRouter;

/// Capacity of the control-plane registration channel
const REGISTRATION_CHANNEL_CAPACITY: usize = 64;

/// Wires the registry, pool, router, middleware and pipeline together and
/// owns their shared shutdown signal.
pub struct App {
    config: Arc<Config>,
    registry: Registry,
    pool: Arc<ServerPool>,
    router: Arc<PathRouter>,
    limiter: Arc<IpRateLimiter>,
    cache: Arc<MemoryCache>,
    pipeline: Arc<Pipeline>,
    registration_tx: mpsc::Sender<RegistrationInput>,
    registration_rx: Mutex<Option<mpsc::Receiver<RegistrationInput>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl App {
    pub fn new(config: Arc<Config>) -> ShoalResult<Self> {
        let factory = strategy_factory(&config.load_balancer.strategy)?;

        let registry = Registry::new(Some(config.health_check_interval()));
        let update_rx = registry
            .take_update_receiver()
            .ok_or_else(|| ShoalError::internal("update channel already taken"))?;
        let pool = ServerPool::new(update_rx, factory);

        let router = Arc::new(PathRouter::from_file(&config.routing.file)?);

        let cache = Arc::new(MemoryCache::new());
        let sticky = Arc::new(StickyManager::new(
            Arc::clone(&cache) as Arc<dyn SessionCache>,
            None,
        ));
        let limiter = Arc::new(IpRateLimiter::new(RateLimitConfig::default()));

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&router),
            Arc::clone(&pool),
            Arc::clone(&limiter),
            sticky,
        ));

        let (registration_tx, registration_rx) = mpsc::channel(REGISTRATION_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(8);

        Ok(Self {
            config,
            registry,
            pool,
            router,
            limiter,
            cache,
            pipeline,
            registration_tx,
            registration_rx: Mutex::new(Some(registration_rx)),
            shutdown_tx,
        })
    }

    /// Start every background service: registry loops, rate-limit cleaner,
    /// cache sweeper and the routing-file watcher.
    pub fn start(&self) -> ShoalResult<()> {
        info!("Starting load balancer services");

        let registration_rx = self
            .registration_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ShoalError::internal("app already started"))?;

        self.registry.start(registration_rx);
        Arc::clone(&self.limiter).start_cleaner(self.shutdown_tx.subscribe());
        self.cache.start_cleanup(self.shutdown_tx.subscribe());
        Arc::clone(&self.router).watch(self.shutdown_tx.subscribe())?;

        Ok(())
    }

    /// Push the statically configured backends through the registration
    /// channel, as the control plane would.
    pub async fn seed_configured_backends(&self) {
        for input in self.config.registration_inputs() {
            let id = input.instance_id.clone();
            if let Err(e) = self.registration_tx.send(input).await {
                warn!(instance = %id, error = %e, "Failed to seed configured backend");
            }
        }
    }

    /// Sender half of the registration channel, for the control plane.
    pub fn registration_sender(&self) -> mpsc::Sender<RegistrationInput> {
        self.registration_tx.clone()
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop all background services and drain them. Idempotent.
    pub async fn stop(&self) {
        info!("Shutting down load balancer");

        let _ = self.shutdown_tx.send(());
        self.registry.stop().await;
        self.pool.close().await;

        info!("Shutdown completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_configs() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let mut routing = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            routing,
            "[[rules]]\nprefix = \"/svc-a\"\nservice_name = \"svc-a\"\nstrip_prefix = true"
        )
        .unwrap();
        routing.flush().unwrap();

        let mut config = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            config,
            "[server]\nport = 8080\n\n[routing]\nfile = \"{}\"",
            routing.path().display()
        )
        .unwrap();
        config.flush().unwrap();

        (config, routing)
    }

    #[tokio::test]
    async fn test_app_lifecycle() {
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            let (config_file, _routing_file) = write_configs();
            let config = Config::from_file(config_file.path()).await.unwrap();

            let app = App::new(Arc::new(config)).unwrap();
            app.start().unwrap();
            // A second start is rejected, not a panic.
            assert!(app.start().is_err());

            // Register through the channel like a control plane would.
            app.registration_sender()
                .send(RegistrationInput {
                    service_name: "svc-a".to_string(),
                    instance_id: "i1".to_string(),
                    host: "127.0.0.1".to_string(),
                    port: 9001,
                    weight: None,
                    metadata: Default::default(),
                })
                .await
                .unwrap();

            // The pool eventually reflects the registration.
            for _ in 0..100 {
                if app.pool().healthy_len("svc-a") == 1 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            assert_eq!(app.pool().healthy_len("svc-a"), 1);

            app.stop().await;
            app.stop().await;
        })
        .await
        .expect("test_app_lifecycle timed out");
    }
}

//! End-to-end scenarios: a real proxy server fronting real hyper backends
//! on ephemeral ports.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, StatusCode};
use tokio::sync::broadcast;

use shoal::balancer::strategy_factory;
use shoal::middleware::{IpRateLimiter, RateLimitConfig, StickyManager};
use shoal::model::BackendInstance;
use shoal::pool::ServerPool;
use shoal::proxy::{Pipeline, ProxyServer};
use shoal::registry::Registry;
use shoal::router::PathRouter;
use shoal::{MemoryCache, SessionCache};

/// A backend that answers 200 with its tag as the body and counts requests.
async fn spawn_backend(tag: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_srv = Arc::clone(&counter);

    let make_svc = make_service_fn(move |_| {
        let counter = Arc::clone(&counter_srv);
        async move {
            Ok::<_, Infallible>(service_fn(move |_req| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(Response::new(Body::from(tag)))
                }
            }))
        }
    });

    let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    (addr, counter)
}

/// A backend that fails with 500 for the first `failures` requests.
async fn spawn_flaky_backend(failures: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_srv = Arc::clone(&counter);

    let make_svc = make_service_fn(move |_| {
        let counter = Arc::clone(&counter_srv);
        async move {
            Ok::<_, Infallible>(service_fn(move |_req| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let status = if n < failures {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    };
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(status)
                            .body(Body::from("flaky"))
                            .unwrap(),
                    )
                }
            }))
        }
    });

    let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    (addr, counter)
}

struct Harness {
    registry: Registry,
    pool: Arc<ServerPool>,
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    _routing_file: tempfile::NamedTempFile,
}

impl Harness {
    /// Stand up router + registry + pool + middleware + public server.
    async fn start(strategy: &str, limits: RateLimitConfig) -> Self {
        let mut routing_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            routing_file,
            "[[rules]]\nprefix = \"/svc-a\"\nservice_name = \"svc-a\"\nstrip_prefix = true"
        )
        .unwrap();
        routing_file.flush().unwrap();

        // Long check interval: scenarios drive health transitions directly.
        let registry = Registry::new(Some(Duration::from_secs(3600)));
        let update_rx = registry.take_update_receiver().unwrap();
        let pool = ServerPool::new(update_rx, strategy_factory(strategy).unwrap());

        let router = Arc::new(PathRouter::from_file(routing_file.path()).unwrap());
        let cache = Arc::new(MemoryCache::new()) as Arc<dyn SessionCache>;
        let sticky = Arc::new(StickyManager::new(cache, None));
        let limiter = Arc::new(IpRateLimiter::new(limits));

        let pipeline = Arc::new(Pipeline::new(
            router,
            Arc::clone(&pool),
            limiter,
            sticky,
        ));

        let (shutdown_tx, _) = broadcast::channel(4);
        let server = ProxyServer::new(pipeline, "127.0.0.1:0".parse().unwrap());
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = server.run(shutdown_rx, Some(ready_tx)).await;
        });
        let addr = ready_rx.await.unwrap();

        Self {
            registry,
            pool,
            addr,
            shutdown_tx,
            _routing_file: routing_file,
        }
    }

    /// Generous limits for scenarios that are not about rate limiting.
    async fn start_unlimited(strategy: &str) -> Self {
        Self::start(
            strategy,
            RateLimitConfig {
                tokens_per_second: 1000,
                burst: 1000,
            },
        )
        .await
    }

    async fn register(&self, id: &str, addr: SocketAddr, weight: i64) -> Arc<BackendInstance> {
        let instance = Arc::new(BackendInstance::new(
            id,
            "svc-a",
            addr.ip().to_string(),
            addr.port(),
            weight,
            HashMap::new(),
        ));
        self.registry.register(Arc::clone(&instance)).await.unwrap();
        self.wait_until_pooled(id).await;
        instance
    }

    async fn wait_until_pooled(&self, id: &str) {
        for _ in 0..200 {
            if self.pool.get_instance("svc-a", id).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("instance {} never appeared in the pool", id);
    }

    async fn get(&self, path: &str, cookie: Option<&str>) -> (StatusCode, hyper::HeaderMap, String) {
        let client = Client::new();
        let mut builder = Request::builder()
            .method(hyper::Method::GET)
            .uri(format!("http://{}{}", self.addr, path));
        if let Some(cookie) = cookie {
            builder = builder.header(hyper::header::COOKIE, cookie);
        }

        let resp = client
            .request(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, headers, String::from_utf8_lossy(&body).to_string())
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.registry.stop().await;
        self.pool.close().await;
    }
}

/// S1: three equal-weight instances, nine requests, three hits each.
#[tokio::test]
async fn scenario_round_robin_equal_weights() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let harness = Harness::start_unlimited("round_robin").await;

        let (addr1, c1) = spawn_backend("b1").await;
        let (addr2, c2) = spawn_backend("b2").await;
        let (addr3, c3) = spawn_backend("b3").await;
        harness.register("b1", addr1, 1).await;
        harness.register("b2", addr2, 1).await;
        harness.register("b3", addr3, 1).await;

        for _ in 0..9 {
            let (status, _, _) = harness.get("/svc-a/", None).await;
            assert_eq!(status, StatusCode::OK);
        }

        assert_eq!(c1.load(Ordering::SeqCst), 3);
        assert_eq!(c2.load(Ordering::SeqCst), 3);
        assert_eq!(c3.load(Ordering::SeqCst), 3);

        harness.stop().await;
    })
    .await
    .expect("scenario_round_robin_equal_weights timed out");
}

/// S2: weights {1,2,3} over 60 requests converge to {10,20,30} (±2).
#[tokio::test]
async fn scenario_weighted_distribution() {
    tokio::time::timeout(Duration::from_secs(60), async {
        let harness = Harness::start_unlimited("round_robin").await;

        let (addr1, c1) = spawn_backend("w1").await;
        let (addr2, c2) = spawn_backend("w2").await;
        let (addr3, c3) = spawn_backend("w3").await;
        harness.register("w1", addr1, 1).await;
        harness.register("w2", addr2, 2).await;
        harness.register("w3", addr3, 3).await;

        for _ in 0..60 {
            let (status, _, _) = harness.get("/svc-a/", None).await;
            assert_eq!(status, StatusCode::OK);
        }

        let n1 = c1.load(Ordering::SeqCst) as i64;
        let n2 = c2.load(Ordering::SeqCst) as i64;
        let n3 = c3.load(Ordering::SeqCst) as i64;
        assert!((n1 - 10).abs() <= 2, "weight-1 backend got {}", n1);
        assert!((n2 - 20).abs() <= 2, "weight-2 backend got {}", n2);
        assert!((n3 - 30).abs() <= 2, "weight-3 backend got {}", n3);

        harness.stop().await;
    })
    .await
    .expect("scenario_weighted_distribution timed out");
}

/// S3: failover away from an unhealthy instance, then a late joiner shows
/// up in the snapshot after one update cycle.
#[tokio::test]
async fn scenario_failover_and_join() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let harness = Harness::start_unlimited("round_robin").await;

        let (addr1, c1) = spawn_backend("f1").await;
        let (addr2, c2) = spawn_backend("f2").await;
        let i1 = harness.register("f1", addr1, 1).await;
        harness.register("f2", addr2, 1).await;

        // Health checker reports f1 down.
        harness.registry.update_status(&i1, false).await;
        for _ in 0..200 {
            if harness.pool.get_instance("svc-a", "f1").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let before = c1.load(Ordering::SeqCst);
        for _ in 0..4 {
            let (status, _, body) = harness.get("/svc-a/", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "f2");
        }
        assert_eq!(c1.load(Ordering::SeqCst), before);
        assert!(c2.load(Ordering::SeqCst) >= 4);

        // A third instance registers and the snapshot picks it up.
        let (addr3, _c3) = spawn_backend("f3").await;
        harness.register("f3", addr3, 1).await;
        assert!(harness.pool.get_instance("svc-a", "f3").is_some());
        assert_eq!(harness.pool.healthy_len("svc-a"), 2);

        harness.stop().await;
    })
    .await
    .expect("scenario_failover_and_join timed out");
}

/// S4: the first response sets `lb_sid`; requests carrying the cookie keep
/// hitting the same backend while others stay healthy.
#[tokio::test]
async fn scenario_sticky_session() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let harness = Harness::start_unlimited("round_robin").await;

        let (addr1, _c1) = spawn_backend("s1").await;
        let (addr2, _c2) = spawn_backend("s2").await;
        let (addr3, _c3) = spawn_backend("s3").await;
        harness.register("s1", addr1, 1).await;
        harness.register("s2", addr2, 1).await;
        harness.register("s3", addr3, 1).await;

        let (status, headers, first_body) = harness.get("/svc-a/", None).await;
        assert_eq!(status, StatusCode::OK);

        let set_cookie = headers
            .get(hyper::header::SET_COOKIE)
            .expect("first response must set the session cookie")
            .to_str()
            .unwrap()
            .to_string();
        assert!(set_cookie.starts_with("lb_sid="));
        let cookie = set_cookie.split(';').next().unwrap().to_string();

        for _ in 0..6 {
            let (status, headers, body) = harness.get("/svc-a/", Some(&cookie)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, first_body);
            // An established session is not re-minted.
            assert!(headers.get(hyper::header::SET_COOKIE).is_none());
        }

        // A stale cookie gets cleared and a fresh session minted.
        let (status, headers, _) = harness
            .get("/svc-a/", Some("lb_sid=00000000000000000000000000000000"))
            .await;
        assert_eq!(status, StatusCode::OK);
        let new_cookie = headers
            .get(hyper::header::SET_COOKIE)
            .expect("stale session must be re-minted")
            .to_str()
            .unwrap();
        assert!(new_cookie.starts_with("lb_sid="));
        assert_ne!(new_cookie, set_cookie);

        harness.stop().await;
    })
    .await
    .expect("scenario_sticky_session timed out");
}

/// S5: burst of 10 from one IP with b=5, r=2: five pass, the rest are 429
/// until the bucket refills.
#[tokio::test]
async fn scenario_rate_limit() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let harness = Harness::start(
            "round_robin",
            RateLimitConfig {
                tokens_per_second: 2,
                burst: 5,
            },
        )
        .await;

        let (addr1, _c1) = spawn_backend("r1").await;
        harness.register("r1", addr1, 1).await;

        let mut ok = 0;
        let mut limited = 0;
        for _ in 0..10 {
            let (status, _, body) = harness.get("/svc-a/", None).await;
            if status == StatusCode::TOO_MANY_REQUESTS {
                assert_eq!(body, "Too Many Requests");
                limited += 1;
            } else {
                assert_eq!(status, StatusCode::OK);
                ok += 1;
            }
        }
        assert_eq!(ok, 5);
        assert_eq!(limited, 5);

        // One token refills after ~500ms at r=2.
        tokio::time::sleep(Duration::from_millis(700)).await;
        let (status, _, _) = harness.get("/svc-a/", None).await;
        assert_eq!(status, StatusCode::OK);

        harness.stop().await;
    })
    .await
    .expect("scenario_rate_limit timed out");
}

/// S6: three 500s then 200 succeeds through retries; a persistently failing
/// backend opens the breaker and subsequent calls fail fast with 503.
#[tokio::test]
async fn scenario_retry_and_breaker() {
    tokio::time::timeout(Duration::from_secs(60), async {
        // Part one: transient failures are retried to success.
        {
            let harness = Harness::start_unlimited("round_robin").await;
            let (addr, counter) = spawn_flaky_backend(3).await;
            harness.register("flaky", addr, 1).await;

            let (status, _, _) = harness.get("/svc-a/", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(counter.load(Ordering::SeqCst), 4);

            harness.stop().await;
        }

        // Part two: a backend that never recovers trips the breaker.
        {
            let harness = Harness::start_unlimited("round_robin").await;
            let (addr, counter) = spawn_flaky_backend(usize::MAX).await;
            harness.register("dead", addr, 1).await;

            let (status, _, body) = harness.get("/svc-a/", None).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body, "Backend service unreachable or unavailable");
            // Four consecutive 500s opened the breaker.
            assert_eq!(counter.load(Ordering::SeqCst), 4);

            // While the breaker is open the backend sees no traffic.
            let (status, _, _) = harness.get("/svc-a/", None).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(counter.load(Ordering::SeqCst), 4);

            harness.stop().await;
        }
    })
    .await
    .expect("scenario_retry_and_breaker timed out");
}

/// Requests outside every rule 404 with the fixed body.
#[tokio::test]
async fn scenario_unmatched_path_is_404() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let harness = Harness::start_unlimited("round_robin").await;

        let (status, headers, body) = harness.get("/nowhere/", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "No matching service");
        // X-Request-ID is always echoed.
        assert!(headers.get("x-request-id").is_some());

        harness.stop().await;
    })
    .await
    .expect("scenario_unmatched_path_is_404 timed out");
}

/// A matched service with no registered backend answers 503.
#[tokio::test]
async fn scenario_no_backend_is_503() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let harness = Harness::start_unlimited("round_robin").await;

        let (status, _, body) = harness.get("/svc-a/", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "No healthy backend available");

        harness.stop().await;
    })
    .await
    .expect("scenario_no_backend_is_503 timed out");
}

/// The forwarded request carries the proxy headers and the stripped path.
#[tokio::test]
async fn scenario_forwarded_headers() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let harness = Harness::start_unlimited("ip_hash").await;

        // A backend that echoes the interesting request headers.
        let make_svc = make_service_fn(move |_| async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| async move {
                let headers = req.headers();
                let summary = format!(
                    "path={};xff={};by={};target={};traceparent={}",
                    req.uri().path(),
                    header(headers, "x-forwarded-for"),
                    header(headers, "x-forwarded-by"),
                    header(headers, "x-target-instance-id"),
                    if headers.contains_key("traceparent") { "yes" } else { "no" },
                );
                Ok::<_, Infallible>(Response::new(Body::from(summary)))
            }))
        });
        let backend = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let backend_addr = backend.local_addr();
        tokio::spawn(backend);

        harness.register("echo", backend_addr, 1).await;

        let (status, _, body) = harness.get("/svc-a/inner?x=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("path=/inner"), "body: {}", body);
        assert!(body.contains("xff=127.0.0.1:"), "body: {}", body);
        assert!(body.contains("by=shoal"), "body: {}", body);
        assert!(body.contains("target=echo"), "body: {}", body);
        assert!(body.contains("traceparent=yes"), "body: {}", body);

        harness.stop().await;
    })
    .await
    .expect("scenario_forwarded_headers timed out");
}

fn header(headers: &hyper::HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use hyper::header::{HeaderValue, HOST};
use hyper::{Body, Request, Response, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::resilience::ResilientTransport;

/// Default instance TTL applied at registration
pub const DEFAULT_INSTANCE_TTL: Duration = Duration::from_secs(30);
/// Default weight when a registration carries none (or a non-positive one)
pub const DEFAULT_WEIGHT: u32 = 1;

/// One `(service, instance)` affinity entry stored per sticky session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePair {
    pub service_name: String,
    pub instance_id: String,
}

/// Registration record delivered by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationInput {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub weight: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// One addressable backend process behind a service name.
///
/// The registry owns the record and mutates health/heartbeat; the server
/// pool shares read-only references through its snapshot. Health and the
/// active-connection counter are atomics so readers never take a lock.
pub struct BackendInstance {
    instance_id: String,
    service_name: String,
    host: String,
    port: u16,
    weight: u32,
    metadata: HashMap<String, String>,
    ttl: Duration,
    health: AtomicBool,
    last_heartbeat: RwLock<Instant>,
    active_conns: AtomicI64,
    transport: RwLock<Option<Arc<ResilientTransport>>>,
}

impl BackendInstance {
    pub fn new(
        instance_id: impl Into<String>,
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        weight: i64,
        metadata: HashMap<String, String>,
    ) -> Self {
        let weight = if weight <= 0 {
            DEFAULT_WEIGHT
        } else {
            weight as u32
        };

        Self {
            instance_id: instance_id.into(),
            service_name: service_name.into(),
            host: host.into(),
            port,
            weight,
            metadata,
            ttl: DEFAULT_INSTANCE_TTL,
            health: AtomicBool::new(true),
            last_heartbeat: RwLock::new(Instant::now()),
            active_conns: AtomicI64::new(0),
            transport: RwLock::new(None),
        }
    }

    pub fn from_input(input: RegistrationInput) -> Self {
        Self::new(
            input.instance_id,
            input.service_name,
            input.host,
            input.port,
            input.weight.unwrap_or(DEFAULT_WEIGHT as i64),
            input.metadata,
        )
    }

    pub fn id(&self) -> &str {
        &self.instance_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn addr(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn weight(&self) -> u32 {
        self.weight.max(1)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn is_healthy(&self) -> bool {
        self.health.load(Ordering::Acquire)
    }

    /// Flip the health flag; a live instance also refreshes its heartbeat
    pub fn set_alive(&self, status: bool) {
        self.health.store(status, Ordering::Release);
        if status {
            self.touch_heartbeat();
        }
    }

    pub fn touch_heartbeat(&self) {
        let mut hb = self.last_heartbeat.write().unwrap_or_else(|e| e.into_inner());
        *hb = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat()) > self.ttl
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active_conns(&self) -> i64 {
        self.active_conns.load(Ordering::Acquire)
    }

    pub fn has_transport(&self) -> bool {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn set_transport(&self, transport: Arc<ResilientTransport>) {
        let mut guard = self.transport.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(transport);
    }

    fn transport(&self) -> Option<Arc<ResilientTransport>> {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Forward `req` to this backend as a reverse proxy.
    ///
    /// Rewrites the request to target `http://host:port`, stamps the
    /// forwarding headers and sends it through the instance's resilient
    /// transport. Any transport failure collapses to a fixed 503.
    pub async fn serve(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        let transport = match self.transport() {
            Some(t) => t,
            None => {
                warn!(
                    service = %self.service_name,
                    instance = %self.instance_id,
                    "Instance has no transport installed"
                );
                return unavailable_response();
            }
        };

        let outbound = match self.build_forward_request(req, remote_addr) {
            Ok(r) => r,
            Err(e) => {
                warn!(instance = %self.instance_id, error = %e, "Failed to build upstream request");
                return unavailable_response();
            }
        };

        match transport.round_trip(outbound).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(
                    service = %self.service_name,
                    instance = %self.instance_id,
                    error = %e,
                    "Upstream round trip failed"
                );
                unavailable_response()
            }
        }
    }

    fn build_forward_request(
        &self,
        req: Request<Body>,
        remote_addr: SocketAddr,
    ) -> crate::error::ShoalResult<Request<Body>> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let authority = self.authority();
        let uri: Uri = format!("http://{}{}", authority, path_and_query).parse()?;
        parts.uri = uri;

        let remote = remote_addr.to_string();
        let forwarded_for = match parts.headers.get("x-forwarded-for") {
            Some(existing) => {
                let prior = existing.to_str().unwrap_or_default();
                format!("{}, {}", prior, remote)
            }
            None => remote,
        };
        parts.headers.insert(
            "x-forwarded-for",
            HeaderValue::from_str(&forwarded_for)
                .unwrap_or_else(|_| HeaderValue::from_static("invalid")),
        );

        parts
            .headers
            .insert("x-forwarded-by", HeaderValue::from_static("shoal"));
        parts.headers.insert(
            "x-target-instance-id",
            HeaderValue::from_str(&self.instance_id)
                .unwrap_or_else(|_| HeaderValue::from_static("invalid")),
        );
        if !parts.headers.contains_key("x-forwarded-proto") {
            parts
                .headers
                .insert("x-forwarded-proto", HeaderValue::from_static("http"));
        }
        parts.headers.insert(
            HOST,
            HeaderValue::from_str(&authority)
                .unwrap_or_else(|_| HeaderValue::from_static("invalid")),
        );

        debug!(
            instance = %self.instance_id,
            uri = %parts.uri,
            "Forwarding request to backend"
        );

        Ok(Request::from_parts(parts, body))
    }
}

impl std::fmt::Debug for BackendInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendInstance")
            .field("instance_id", &self.instance_id)
            .field("service_name", &self.service_name)
            .field("addr", &self.authority())
            .field("weight", &self.weight)
            .field("healthy", &self.is_healthy())
            .field("active_conns", &self.active_conns())
            .finish()
    }
}

fn unavailable_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .body(Body::from("Backend service unreachable or unavailable"))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

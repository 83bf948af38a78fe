use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::header::{HeaderValue, SET_COOKIE};
use hyper::{Body, Request, Response, StatusCode, Uri};
use tracing::{debug, warn};

use crate::middleware::logging;
use crate::middleware::trace::HEADER_REQUEST_ID;
use crate::middleware::{IpRateLimiter, RequestContext, StickyLookup, StickyManager};
use crate::model::{BackendInstance, ServicePair};
use crate::pool::ServerPool;
use crate::router::PathRouter;

/// Composes the request path: request-id → trace-context → access log →
/// sticky resolution → rate limit → service handler → reverse proxy.
pub struct Pipeline {
    router: Arc<PathRouter>,
    pool: Arc<ServerPool>,
    limiter: Arc<IpRateLimiter>,
    sticky: Arc<StickyManager>,
}

impl Pipeline {
    pub fn new(
        router: Arc<PathRouter>,
        pool: Arc<ServerPool>,
        limiter: Arc<IpRateLimiter>,
        sticky: Arc<StickyManager>,
    ) -> Self {
        Self {
            router,
            pool,
            limiter,
            sticky,
        }
    }

    pub async fn handle(&self, req: Request<Body>, remote: SocketAddr) -> Response<Body> {
        let start = Instant::now();
        let ctx = RequestContext::from_headers(req.headers());

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let lookup = self.sticky.lookup(req.headers()).await;

        let mut cookies: Vec<String> = Vec::new();
        let mut response = if self.limiter.check(remote.ip()) {
            self.service_handler(req, remote, &ctx, &lookup, &mut cookies)
                .await
        } else {
            warn!(ip = %remote.ip(), method = %method, path = %path, "Rate limit exceeded");
            text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests")
        };

        // A stale session cookie is cleared unless a fresh one replaced it.
        if matches!(lookup, StickyLookup::Stale) && cookies.is_empty() {
            cookies.push(self.sticky.clear_cookie());
        }
        for cookie in cookies {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }

        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response.headers_mut().insert(HEADER_REQUEST_ID, value);
        }

        logging::record(
            &method,
            &path,
            query.as_deref(),
            remote.ip(),
            response.status(),
            start.elapsed(),
        );

        response
    }

    async fn service_handler(
        &self,
        mut req: Request<Body>,
        remote: SocketAddr,
        ctx: &RequestContext,
        lookup: &StickyLookup,
        cookies: &mut Vec<String>,
    ) -> Response<Body> {
        let path = req.uri().path().to_string();

        let service = self.router.match_service(&path);
        if service.is_empty() {
            warn!(path = %path, "No service matched");
            return text_response(StatusCode::NOT_FOUND, "No matching service");
        }

        let secure = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .map(|proto| proto.eq_ignore_ascii_case("https"))
            .unwrap_or(false);

        let Some(backend) = self
            .resolve_backend(&service, remote, lookup, secure, cookies)
            .await
        else {
            warn!(service = %service, "No healthy backend");
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "No healthy backend available");
        };

        if self.router.strip_prefix(&path) {
            strip_service_prefix(&mut req, &service);
        }

        ctx.propagate(req.headers_mut());

        debug!(
            trace_id = %ctx.trace.trace_id,
            service = %service,
            backend = %backend.addr(),
            "Routed request"
        );

        backend.inc_conn();
        let response = backend.serve(req, remote).await;
        backend.dec_conn();

        response
    }

    /// Sticky override first, strategy pick second.
    ///
    /// A sticky pair whose instance is still healthy wins. Otherwise the
    /// service's strategy picks; a session that lacked a pair for this
    /// service gets the new pair appended, and a request with no session at
    /// all mints one.
    async fn resolve_backend(
        &self,
        service: &str,
        remote: SocketAddr,
        lookup: &StickyLookup,
        secure: bool,
        cookies: &mut Vec<String>,
    ) -> Option<Arc<BackendInstance>> {
        let client_ip = remote.ip().to_string();

        let sticky_ctx = match lookup {
            StickyLookup::Hit(ctx) => Some(ctx),
            _ => None,
        };

        let pinned = sticky_ctx.and_then(|ctx| {
            ctx.pairs
                .iter()
                .find(|pair| pair.service_name == service)
                .and_then(|pair| self.pool.get_instance(service, &pair.instance_id))
        });
        if let Some(backend) = pinned {
            debug!(service = %service, backend = %backend.id(), "Sticky session routed");
            return Some(backend);
        }

        let picked = self.pool.pick(service, &client_ip)?;

        match sticky_ctx {
            Some(ctx) if !ctx.pairs.iter().any(|p| p.service_name == service) => {
                let pair = ServicePair {
                    service_name: service.to_string(),
                    instance_id: picked.id().to_string(),
                };
                if let Err(e) = self.sticky.append_pair(&ctx.cache_key, pair).await {
                    warn!(service = %service, error = %e, "Failed to append sticky pair");
                }
            }
            Some(_) => {
                // The recorded instance is gone; route fresh and let the
                // affinity resume if it comes back.
            }
            None => match self.sticky.create_session(service, picked.id(), secure).await {
                Ok(cookie) => cookies.push(cookie),
                Err(e) => warn!(service = %service, error = %e, "Failed to create sticky session"),
            },
        }

        Some(picked)
    }
}

/// Rewrite the request path by removing the leading `"/" + service`.
fn strip_service_prefix(req: &mut Request<Body>, service: &str) {
    let path = req.uri().path();
    let prefix = format!("/{}", service);

    let Some(stripped) = path.strip_prefix(&prefix) else {
        return;
    };
    let stripped = if stripped.is_empty() { "/" } else { stripped };

    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{}", stripped, query),
        None => stripped.to_string(),
    };

    if let Ok(uri) = path_and_query.parse::<Uri>() {
        *req.uri_mut() = uri;
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

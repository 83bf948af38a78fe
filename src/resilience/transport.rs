use std::sync::Arc;
use std::time::Duration;

use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response};
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::error::{ShoalError, ShoalResult};
use crate::resilience::{CircuitBreaker, ExponentialRetry};

/// Shared upstream client with connection pooling.
///
/// A single instance is reused by every transport so idle connections are
/// pooled per host across instances.
static SHARED_CLIENT: Lazy<Client<HttpConnector>> = Lazy::new(|| {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .build(connector)
});

/// Circuit breaker + retry composed around the upstream round trip.
///
/// The request body is buffered once so every attempt can resend it. A
/// response with status >= 500 counts as a failure: its body is dropped and
/// the attempt is retried, subject to the breaker.
pub struct ResilientTransport {
    breaker: Arc<CircuitBreaker>,
    retry: ExponentialRetry,
    client: Client<HttpConnector>,
}

impl ResilientTransport {
    pub fn new(breaker: Arc<CircuitBreaker>, retry: ExponentialRetry) -> Self {
        Self {
            breaker,
            retry,
            client: SHARED_CLIENT.clone(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn round_trip(&self, req: Request<Body>) -> ShoalResult<Response<Body>> {
        let (parts, body) = req.into_parts();
        let body_bytes = hyper::body::to_bytes(body)
            .await
            .map_err(|e| ShoalError::network(format!("failed to buffer request body: {}", e)))?;

        self.retry
            .run(|| {
                let req = clone_request(&parts, &body_bytes);
                async move {
                    self.breaker
                        .call(|| async move {
                            let resp = self.client.request(req).await.map_err(ShoalError::from)?;

                            let status = resp.status();
                            if status.as_u16() >= 500 {
                                // Close the body before the next attempt.
                                drop(resp);
                                warn!(status = %status, "Backend answered with a server error");
                                return Err(ShoalError::backend_unavailable(format!(
                                    "backend error status: {}",
                                    status
                                )));
                            }

                            debug!(status = %status, "Upstream attempt succeeded");
                            Ok(resp)
                        })
                        .await
                }
            })
            .await
    }
}

/// Rebuild an owned request from its recorded parts and buffered body
fn clone_request(parts: &hyper::http::request::Parts, body: &Bytes) -> Request<Body> {
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(parts.uri.clone())
        .version(parts.version);

    if let Some(headers) = builder.headers_mut() {
        *headers = parts.headers.clone();
    }

    let body = if body.is_empty() {
        Body::empty()
    } else {
        Body::from(body.clone())
    };

    builder
        .body(body)
        .unwrap_or_else(|_| Request::new(Body::empty()))
}

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use tokio::sync::{broadcast, oneshot};
use tracing::info;

use crate::error::ShoalResult;
use crate::proxy::Pipeline;

/// Public HTTP/1.1 data plane.
pub struct ProxyServer {
    pipeline: Arc<Pipeline>,
    bind: SocketAddr,
}

impl ProxyServer {
    pub fn new(pipeline: Arc<Pipeline>, bind: SocketAddr) -> Self {
        Self { pipeline, bind }
    }

    /// Bind and serve until the shutdown signal fires.
    ///
    /// The bound address (useful with port 0) is reported through `ready`
    /// before the first connection is accepted.
    pub async fn run(
        &self,
        mut shutdown: broadcast::Receiver<()>,
        ready: Option<oneshot::Sender<SocketAddr>>,
    ) -> ShoalResult<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let remote = conn.remote_addr();
            let pipeline = Arc::clone(&pipeline);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let pipeline = Arc::clone(&pipeline);
                    async move { Ok::<_, Infallible>(pipeline.handle(req, remote).await) }
                }))
            }
        });

        let server = hyper::Server::try_bind(&self.bind)?.serve(make_svc);
        let addr = server.local_addr();
        info!(addr = %addr, "Load balancer is listening");

        if let Some(ready) = ready {
            let _ = ready.send(addr);
        }

        server
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("Public server draining");
            })
            .await
            .map_err(crate::error::ShoalError::from)
    }
}

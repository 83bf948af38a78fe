use std::net::IpAddr;
use std::time::Duration;

use hyper::{Method, StatusCode};
use tracing::{error, info, warn};

/// Emit one access-log line for a completed request.
///
/// The level follows the status class: 5xx logs at error, 4xx at warn,
/// everything else at info.
pub fn record(
    method: &Method,
    path: &str,
    query: Option<&str>,
    remote_ip: IpAddr,
    status: StatusCode,
    latency: Duration,
) {
    let latency_us = latency.as_micros() as u64;
    let status = status.as_u16();

    match status {
        500.. => error!(
            method = %method,
            path,
            query = query.unwrap_or(""),
            remote_ip = %remote_ip,
            status,
            latency_us,
            "HTTP request completed"
        ),
        400..=499 => warn!(
            method = %method,
            path,
            query = query.unwrap_or(""),
            remote_ip = %remote_ip,
            status,
            latency_us,
            "HTTP request completed"
        ),
        _ => info!(
            method = %method,
            path,
            query = query.unwrap_or(""),
            remote_ip = %remote_ip,
            status,
            latency_us,
            "HTTP request completed"
        ),
    }
}

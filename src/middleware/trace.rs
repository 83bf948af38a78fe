use hyper::header::{HeaderMap, HeaderValue};
use tracing::debug;
use uuid::Uuid;

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_TRACEPARENT: &str = "traceparent";
pub const HEADER_TRACESTATE: &str = "tracestate";
const HEADER_AMZN_TRACE: &str = "x-amzn-trace-id";

const FLAG_SAMPLED: u8 = 0x01;

/// W3C trace context carried through the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 hex chars
    pub trace_id: String,
    /// 16 hex chars, minted fresh for this hop
    pub span_id: String,
    pub flags: u8,
    pub trace_state: Option<String>,
}

/// Identity attached to one request by the tracing middlewares
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub trace: TraceContext,
}

impl RequestContext {
    /// Build the context from the incoming headers: request-id first, then
    /// W3C trace-context.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let request_id = request_id_from(headers);
        let trace = trace_context_from(headers);

        debug!(
            request_id = %request_id,
            trace_id = %trace.trace_id,
            span_id = %trace.span_id,
            sampled = trace.flags & FLAG_SAMPLED == FLAG_SAMPLED,
            "Trace context extracted"
        );

        Self { request_id, trace }
    }

    /// Inject `traceparent`, `tracestate` and the request id into an
    /// outbound request's headers.
    pub fn propagate(&self, headers: &mut HeaderMap) {
        let traceparent = format!(
            "00-{}-{}-{:02x}",
            self.trace.trace_id, self.trace.span_id, self.trace.flags
        );
        if let Ok(value) = HeaderValue::from_str(&traceparent) {
            headers.insert(HEADER_TRACEPARENT, value);
        }

        if let Some(state) = &self.trace.trace_state {
            if let Ok(value) = HeaderValue::from_str(state) {
                headers.insert(HEADER_TRACESTATE, value);
            }
        }

        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            headers.insert(HEADER_REQUEST_ID, value);
        }
    }
}

/// `X-Request-ID`, falling back to `X-Amzn-Trace-Id`, falling back to a
/// fresh 32-hex id
pub fn request_id_from(headers: &HeaderMap) -> String {
    header_str(headers, HEADER_REQUEST_ID)
        .or_else(|| header_str(headers, HEADER_AMZN_TRACE))
        .unwrap_or_else(rand_hex32)
}

/// Parse `traceparent`; a valid parent keeps its trace id and flags with a
/// fresh span id, anything else mints a sampled context from scratch.
pub fn trace_context_from(headers: &HeaderMap) -> TraceContext {
    let trace_state = header_str(headers, HEADER_TRACESTATE);

    if let Some(parent) = header_str(headers, HEADER_TRACEPARENT) {
        if let Some((trace_id, flags)) = parse_traceparent(&parent) {
            return TraceContext {
                trace_id,
                span_id: rand_hex16(),
                flags,
                trace_state,
            };
        }
    }

    TraceContext {
        trace_id: rand_hex32(),
        span_id: rand_hex16(),
        flags: FLAG_SAMPLED,
        trace_state,
    }
}

/// `"00-<32 hex>-<16 hex>-<2 hex>"` → (trace_id, flags)
fn parse_traceparent(value: &str) -> Option<(String, u8)> {
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 4 || parts[0] != "00" {
        return None;
    }

    let (trace_id, span_id, flags) = (parts[1], parts[2], parts[3]);
    if trace_id.len() != 32 || !is_hex(trace_id) {
        return None;
    }
    if span_id.len() != 16 || !is_hex(span_id) {
        return None;
    }
    let flags = u8::from_str_radix(flags, 16).ok()?;

    Some((trace_id.to_string(), flags))
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn rand_hex32() -> String {
    Uuid::new_v4().simple().to_string()
}

fn rand_hex16() -> String {
    format!("{:016x}", rand::random::<u64>())
}

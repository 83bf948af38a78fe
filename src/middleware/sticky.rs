use std::sync::Arc;
use std::time::Duration;

use hyper::header::HeaderMap;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::SessionCache;
use crate::error::ShoalResult;
use crate::model::ServicePair;

/// Cookie carrying the session id
pub const STICKY_COOKIE_NAME: &str = "lb_sid";
/// Cache keys are namespaced under this prefix
const CACHE_KEY_PREFIX: &str = "lb:sticky:";
/// Default session lifetime
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Sticky state resolved for one request
#[derive(Debug, Clone)]
pub struct StickyContext {
    pub pairs: Vec<ServicePair>,
    pub cache_key: String,
}

/// Outcome of the sticky middleware lookup
#[derive(Debug, Clone)]
pub enum StickyLookup {
    /// No session cookie on the request
    NoCookie,
    /// Cookie present but the cached session is gone or unreadable; the
    /// client cookie must be cleared
    Stale,
    /// Cookie resolved to a live pair list
    Hit(StickyContext),
}

/// Binds a client session cookie to one backend per service.
///
/// The session value is a list of `(service, instance)` pairs because one
/// client may cross many services; each service's choice is recorded
/// independently through the cache's append-or-refresh contract.
pub struct StickyManager {
    cookie_name: String,
    session_ttl: Duration,
    cache: Arc<dyn SessionCache>,
}

impl StickyManager {
    pub fn new(cache: Arc<dyn SessionCache>, session_ttl: Option<Duration>) -> Self {
        Self {
            cookie_name: STICKY_COOKIE_NAME.to_string(),
            session_ttl: session_ttl.filter(|t| !t.is_zero()).unwrap_or(DEFAULT_SESSION_TTL),
            cache,
        }
    }

    /// Resolve the request's sticky state from its cookie header.
    pub async fn lookup(&self, headers: &HeaderMap) -> StickyLookup {
        let Some(session_id) = cookie_value(headers, &self.cookie_name) else {
            return StickyLookup::NoCookie;
        };
        if session_id.is_empty() {
            return StickyLookup::NoCookie;
        }

        let cache_key = self.cache_key(&session_id);
        match self.cache.get_array(&cache_key).await {
            Ok(items) if !items.is_empty() => {
                let pairs = decode_pairs(items);
                if pairs.is_empty() {
                    warn!(session_id = %session_id, "Sticky session unreadable");
                    return StickyLookup::Stale;
                }
                debug!(session_id = %session_id, pairs = pairs.len(), "Sticky session hit");
                StickyLookup::Hit(StickyContext { pairs, cache_key })
            }
            Ok(_) => {
                warn!(session_id = %session_id, "Sticky session expired");
                StickyLookup::Stale
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Sticky session lookup failed");
                StickyLookup::Stale
            }
        }
    }

    /// Mint a new session bound to `(service, instance_id)`.
    ///
    /// Writes a single-entry pair list under the session key and returns
    /// the `Set-Cookie` value the response must carry.
    pub async fn create_session(
        &self,
        service: &str,
        instance_id: &str,
        secure: bool,
    ) -> ShoalResult<String> {
        let session_id = generate_session_id();
        let key = self.cache_key(&session_id);

        let pair = ServicePair {
            service_name: service.to_string(),
            instance_id: instance_id.to_string(),
        };
        self.cache
            .set_array(&key, vec![serde_json::to_value(&pair)?], Some(self.session_ttl))
            .await?;

        info!(
            session_id = %session_id,
            backend_id = %instance_id,
            ttl_seconds = self.session_ttl.as_secs(),
            "Created new sticky session"
        );

        Ok(self.cookie(&session_id, secure))
    }

    /// Record an additional service's choice under an existing session.
    pub async fn append_pair(&self, cache_key: &str, pair: ServicePair) -> ShoalResult<()> {
        self.cache
            .set_array(cache_key, vec![serde_json::to_value(&pair)?], None)
            .await
    }

    /// `Set-Cookie` value that clears the session cookie
    pub fn clear_cookie(&self) -> String {
        format!("{}=; Path=/; Max-Age=0", self.cookie_name)
    }

    fn cookie(&self, session_id: &str, secure: bool) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.cookie_name,
            session_id,
            self.session_ttl.as_secs()
        );
        if secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    fn cache_key(&self, session_id: &str) -> String {
        format!("{}{}", CACHE_KEY_PREFIX, session_id)
    }
}

/// 128-bit session id rendered as 32 hex chars
fn generate_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn decode_pairs(items: Vec<Value>) -> Vec<ServicePair> {
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

/// Value of the named cookie from a `Cookie` header, if any
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(hyper::header::COOKIE)?.to_str().ok()?;

    for cookie in header.split(';') {
        if let Some((cookie_name, value)) = cookie.trim().split_once('=') {
            if cookie_name.trim() == name {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

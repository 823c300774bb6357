//! Snapshot query client -- an immutable, cloneable facade over the
//! inventory snapshot HTTP service.
//!
//! Every window modifier (`since`, `until`, `all_revisions`,
//! `updated_only`) is copy-on-write: it returns a new client value and
//! leaves the original untouched. Derived clients share the response cache
//! by default, so sibling derivations observe each other's cached
//! responses; `clean()` is the only way to obtain a fresh cache.
//!
//! Responses are cached by the exact resolved URL string. A cache hit
//! performs no network call -- which also means a long-lived client never
//! sees upstream updates for a URL it has already resolved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use driftwatch_core::BoxFuture;
use driftwatch_core::error::SnapshotError;

/// Per-request timeout for snapshot queries.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport seam for the snapshot service.
///
/// Returns the HTTP status and raw body for a resolved URL. Production
/// uses [`HttpTransport`]; tests substitute call-counting mocks.
pub trait Transport: Send + Sync + 'static {
    fn get(&self, url: &str) -> BoxFuture<'_, Result<(u16, String), SnapshotError>>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> BoxFuture<'_, Result<(u16, String), SnapshotError>> {
        let request = self.http.get(url).send();
        let url = url.to_owned();
        Box::pin(async move {
            let response = request.await.map_err(|e| SnapshotError::Transport {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(|e| SnapshotError::Transport {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            Ok((status, body))
        })
    }
}

type ResponseCache = Arc<Mutex<HashMap<String, Value>>>;

/// The snapshot query client.
#[derive(Clone)]
pub struct SnapshotClient {
    base_url: String,
    all_revisions: bool,
    since: Option<i64>,
    until: Option<i64>,
    updated_only: bool,
    cache: ResponseCache,
    transport: Arc<dyn Transport>,
}

impl SnapshotClient {
    /// Create a client for a base URL using the HTTP transport.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_transport(base_url, Arc::new(HttpTransport::new()))
    }

    /// Create a client with an injected transport (tests, embedders).
    pub fn with_transport(base_url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: base_url.into(),
            all_revisions: false,
            since: None,
            until: None,
            updated_only: false,
            cache: Arc::new(Mutex::new(HashMap::new())),
            transport,
        }
    }

    // -- copy-on-write modifiers --

    /// Derive a client whose window starts at `since` (epoch ms).
    pub fn since(&self, since: i64) -> Self {
        let mut derived = self.clone();
        derived.since = Some(since);
        derived
    }

    /// Derive a client whose window ends at `until` (epoch ms).
    pub fn until(&self, until: i64) -> Self {
        let mut derived = self.clone();
        derived.until = Some(until);
        derived
    }

    /// Derive a client that requests every stored revision, not only the
    /// latest.
    pub fn all_revisions(&self) -> Self {
        let mut derived = self.clone();
        derived.all_revisions = true;
        derived
    }

    /// Derive a client that requests only records updated in the window.
    pub fn updated_only(&self) -> Self {
        let mut derived = self.clone();
        derived.updated_only = true;
        derived
    }

    /// A pristine client for the same service: no window modifiers and a
    /// fresh, empty cache.
    pub fn clean(&self) -> Self {
        Self::with_transport(self.base_url.clone(), Arc::clone(&self.transport))
    }

    /// Like [`clean`](Self::clean) but keeping the shared cache, so
    /// previously resolved URLs stay free.
    pub fn soft_clean(&self) -> Self {
        let mut derived = self.clean();
        derived.cache = Arc::clone(&self.cache);
        derived
    }

    /// The window start this client queries with, if any.
    pub fn window_since(&self) -> Option<i64> {
        self.since
    }

    /// The window end this client queries with, if any.
    pub fn window_until(&self) -> Option<i64> {
        self.until
    }

    /// Resolve the final URL for a resource path. Modifiers are appended
    /// in fixed order: revision selector, `_since`, `_until`, `_updated`.
    fn resolve_url(&self, resource: &str) -> String {
        let mut url = format!("{}{}", self.base_url, resource);
        if self.all_revisions {
            url.push_str(";_all");
        }
        if let Some(since) = self.since {
            url.push_str(&format!(";_since={since}"));
        }
        if let Some(until) = self.until {
            url.push_str(&format!(";_until={until}"));
        }
        if self.updated_only {
            url.push_str(";_updated");
        }
        url
    }

    /// Query a resource, parsing the body as JSON.
    ///
    /// Served from the shared cache when the resolved URL has been seen
    /// before. A `code` field in the parsed body is an upstream
    /// application error and raises [`SnapshotError::Upstream`], even on
    /// HTTP 200.
    pub async fn query(&self, resource: &str) -> Result<Value, SnapshotError> {
        let url = self.resolve_url(resource);
        {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(hit) = cache.get(&url) {
                return Ok(hit.clone());
            }
        }
        let parsed = self.fetch(&url).await?;
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert(url, parsed.clone());
        Ok(parsed)
    }

    /// Query a resource and return the raw body, uncached.
    ///
    /// Non-2xx bodies that parse as JSON are raised as
    /// [`SnapshotError::Upstream`] so callers can inspect the payload;
    /// unparseable error bodies raise [`SnapshotError::Parse`].
    pub async fn raw_query(&self, resource: &str) -> Result<String, SnapshotError> {
        let url = self.resolve_url(resource);
        debug!(url = %url, "raw_query");
        let (status, body) = self.transport.get(&url).await?;
        if !(200..300).contains(&status) {
            return match serde_json::from_str::<Value>(&body) {
                Ok(payload) => Err(SnapshotError::Upstream { url, payload }),
                Err(e) => Err(SnapshotError::Parse {
                    url,
                    reason: format!("status {status}, unparseable error body: {e}"),
                }),
            };
        }
        Ok(body)
    }

    async fn fetch(&self, url: &str) -> Result<Value, SnapshotError> {
        debug!(url = %url, "query");
        let (status, body) = self.transport.get(url).await?;
        let parsed: Value = serde_json::from_str(&body).map_err(|e| SnapshotError::Parse {
            url: url.to_owned(),
            reason: format!("status {status}: {e}"),
        })?;
        // The snapshot service signals application errors with a `code`
        // field, independently of the HTTP status.
        if parsed.get("code").is_some() {
            return Err(SnapshotError::Upstream {
                url: url.to_owned(),
                payload: parsed,
            });
        }
        if !(200..300).contains(&status) {
            return Err(SnapshotError::Transport {
                url: url.to_owned(),
                reason: format!("unexpected status {status}"),
            });
        }
        Ok(parsed)
    }
}

//! Bounded fork-join HTTP redirect probing.
//!
//! A fixed-size tokio worker pool fetches every URL up front and blocks
//! until all workers have returned -- no early cancellation, no partial
//! results. A failed or timed-out fetch degrades to
//! [`ProbeOutcome::Unreachable`] instead of aborting the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use driftwatch_core::BoxFuture;

/// Default pool width.
pub const DEFAULT_WORKERS: usize = 16;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of probing one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The endpoint answered 302 with this Location target.
    Redirect(String),
    /// The endpoint answered without redirecting (not behind a gateway).
    NoRedirect,
    /// Connection failure or timeout.
    Unreachable,
}

impl ProbeOutcome {
    /// The string form persisted in the value-diff state map.
    pub fn to_state_value(&self) -> String {
        match self {
            Self::Redirect(target) => target.clone(),
            Self::NoRedirect => "unprotected".to_owned(),
            Self::Unreachable => "-".to_owned(),
        }
    }

    pub fn from_state_value(value: &str) -> Self {
        match value {
            "unprotected" => Self::NoRedirect,
            "-" => Self::Unreachable,
            target => Self::Redirect(target.to_owned()),
        }
    }
}

/// Seam for redirect probing, so rules stay testable without a network.
pub trait RedirectProber: Send + Sync {
    fn probe_all(&self, urls: Vec<String>) -> BoxFuture<'_, HashMap<String, ProbeOutcome>>;
}

/// reqwest-backed prober with redirects disabled.
pub struct HttpRedirectProber {
    http: reqwest::Client,
    workers: usize,
}

impl HttpRedirectProber {
    pub fn new(workers: usize, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http, workers }
    }
}

impl Default for HttpRedirectProber {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS, DEFAULT_TIMEOUT)
    }
}

impl RedirectProber for HttpRedirectProber {
    fn probe_all(&self, urls: Vec<String>) -> BoxFuture<'_, HashMap<String, ProbeOutcome>> {
        let http = self.http.clone();
        let workers = self.workers.max(1);
        Box::pin(async move {
            debug!(urls = urls.len(), workers, "probing redirect targets");
            let semaphore = Arc::new(Semaphore::new(workers));
            let mut tasks = JoinSet::new();
            for url in urls {
                let http = http.clone();
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let outcome = match semaphore.acquire().await {
                        Ok(_permit) => probe_one(&http, &url).await,
                        Err(_) => ProbeOutcome::Unreachable,
                    };
                    (url, outcome)
                });
            }

            // Join barrier: every worker returns before any result is used.
            let mut outcomes = HashMap::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((url, outcome)) => {
                        outcomes.insert(url, outcome);
                    }
                    Err(e) => warn!(error = %e, "probe task panicked"),
                }
            }
            outcomes
        })
    }
}

async fn probe_one(http: &reqwest::Client, url: &str) -> ProbeOutcome {
    // Trailing dots come from DNS record names.
    let target = url.trim_end_matches('.');
    match http.get(target).send().await {
        Ok(response) if response.status().as_u16() == 302 => response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|loc| ProbeOutcome::Redirect(loc.to_owned()))
            .unwrap_or(ProbeOutcome::NoRedirect),
        Ok(_) => ProbeOutcome::NoRedirect,
        Err(_) => ProbeOutcome::Unreachable,
    }
}

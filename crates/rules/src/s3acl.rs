//! `s3acl` rule -- object-store grants handed to principals outside the
//! allow list.
//!
//! Buckets and key hierarchies are visited by bounded random sampling
//! (see [`crate::dedup::sample_population`]); coverage is probabilistic
//! across runs rather than exhaustive per run. Listing and ACL fetch
//! failures are logged and skipped, never fatal.

use std::collections::HashMap;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use driftwatch_core::error::{DriftwatchError, RuleError};
use driftwatch_core::{BoxFuture, Finding};

use crate::dedup::sample_population;
use crate::{Rule, RuleContext};

const NAME: &str = "s3acl";

const DEFAULT_VISIT_PROBABILITY: f64 = 0.1;
const DEFAULT_VISIT_MAX: usize = 5;

/// One page of a prefix listing: objects plus nested prefixes.
#[derive(Debug, Default, Clone)]
pub struct Listing {
    pub keys: Vec<String>,
    pub prefixes: Vec<String>,
}

/// One ACL grant on an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// `None` is the anonymous "everyone" principal.
    pub grantee: Option<String>,
    pub permission: String,
}

/// Narrow object-store interface; the rule needs nothing else.
pub trait ObjectStore: Send + Sync {
    fn list_buckets(&self) -> BoxFuture<'_, Result<Vec<String>, RuleError>>;
    fn list(&self, bucket: &str, prefix: &str) -> BoxFuture<'_, Result<Listing, RuleError>>;
    fn grants(&self, bucket: &str, key: &str) -> BoxFuture<'_, Result<Vec<Grant>, RuleError>>;
}

type AllowedGrant = (String, String);

pub struct S3AclRule {
    store: Option<Arc<dyn ObjectStore>>,
    probability: f64,
    max_budget: usize,
    excluded_buckets: Vec<String>,
    allowed: Vec<AllowedGrant>,
    allowed_specific: HashMap<String, Vec<AllowedGrant>>,
}

impl S3AclRule {
    pub fn new() -> Self {
        Self {
            store: None,
            probability: DEFAULT_VISIT_PROBABILITY,
            max_budget: DEFAULT_VISIT_MAX,
            excluded_buckets: Vec::new(),
            allowed: Vec::new(),
            allowed_specific: HashMap::new(),
        }
    }

    /// Attach a live object store. Without one the rule logs and skips.
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        let mut rule = Self::new();
        rule.store = Some(store);
        rule
    }

    fn allowed_for(&self, bucket: &str) -> Vec<&AllowedGrant> {
        let mut allowed: Vec<&AllowedGrant> = self.allowed.iter().collect();
        if let Some(specific) = self.allowed_specific.get(bucket) {
            allowed.extend(specific.iter());
        }
        allowed
    }

    fn suspicious_grants(&self, bucket: &str, grants: &[Grant]) -> Vec<String> {
        let allowed = self.allowed_for(bucket);
        grants
            .iter()
            .filter(|grant| {
                let uid = grant.grantee.as_deref().unwrap_or("*");
                !allowed
                    .iter()
                    .any(|(auid, aop)| auid == uid && *aop == grant.permission)
            })
            .map(|grant| {
                format!(
                    "{} {}",
                    grant.grantee.as_deref().unwrap_or("Everyone"),
                    grant.permission
                )
            })
            .collect()
    }
}

impl Default for S3AclRule {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_allowed(value: Option<&Value>) -> Vec<AllowedGrant> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let uid = entry.get("uid")?.as_str()?;
            let op = entry.get("op")?.as_str()?;
            Some((uid.to_owned(), op.to_owned()))
        })
        .collect()
}

impl Rule for S3AclRule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
        if let Some(p) = ctx.config.get("visit_probability").and_then(Value::as_f64) {
            self.probability = p;
        }
        if let Some(max) = ctx.config.get("visit_max").and_then(Value::as_u64) {
            self.max_budget = max as usize;
        }
        self.excluded_buckets = crate::config_str_list(&ctx.config, "excluded_buckets");
        self.allowed = parse_allowed(ctx.config.get("allowed"));
        self.allowed_specific = ctx
            .config
            .get("allowed_specific")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(bucket, entries)| (bucket.clone(), parse_allowed(Some(entries))))
                    .collect()
            })
            .unwrap_or_default();
        Ok(())
    }

    async fn execute(&mut self) -> Result<Vec<Finding>, DriftwatchError> {
        let Some(store) = self.store.clone() else {
            warn!(rule = NAME, "no object store attached, skipping");
            return Ok(Vec::new());
        };
        let mut rng = StdRng::from_entropy();
        let buckets: Vec<String> = store
            .list_buckets()
            .await?
            .into_iter()
            .filter(|b| !self.excluded_buckets.contains(b))
            .collect();
        let sampled = sample_population(&mut rng, &buckets, self.probability, self.max_budget, 0);

        let mut findings = Vec::new();
        for bucket in &sampled {
            let keys = traverse(
                store.as_ref(),
                &mut rng,
                self.probability,
                self.max_budget,
                bucket,
                String::new(),
            )
            .await;
            for key in keys {
                let grants = match store.grants(bucket, &key).await {
                    Ok(grants) => grants,
                    Err(e) => {
                        error!(bucket = %bucket, key = %key, error = %e, "acl fetch failed");
                        continue;
                    }
                };
                let suspicious = self.suspicious_grants(bucket, &grants);
                if !suspicious.is_empty() {
                    findings.push(Finding::new(
                        NAME,
                        format!("{bucket}:{key}"),
                        suspicious.into_iter().map(|s| json!(s)).collect(),
                    ));
                }
            }
        }
        Ok(findings)
    }
}

/// Sampled recursive descent through a bucket's prefix hierarchy. The
/// sampling budget shrinks with prefix depth, bounding total listings.
fn traverse<'a>(
    store: &'a dyn ObjectStore,
    rng: &'a mut StdRng,
    probability: f64,
    budget: usize,
    bucket: &'a str,
    prefix: String,
) -> BoxFuture<'a, Vec<String>> {
    Box::pin(async move {
        debug!(bucket, prefix = %prefix, "listing");
        let listing = match store.list(bucket, &prefix).await {
            Ok(listing) => listing,
            Err(e) => {
                error!(bucket, prefix = %prefix, error = %e, "listing failed");
                return Vec::new();
            }
        };
        let depth = prefix.matches('/').count();
        let selected_prefixes =
            sample_population(rng, &listing.prefixes, probability, budget, depth);
        let mut selected_keys = sample_population(rng, &listing.keys, probability, budget, 0);
        for nested in selected_prefixes {
            let descended =
                traverse(store, &mut *rng, probability, budget, bucket, nested).await;
            selected_keys.extend(descended);
        }
        selected_keys
    })
}

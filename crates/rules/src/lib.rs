//! driftwatch-rules -- the rule-plugin contract and the built-in rules.
//!
//! # Module Structure
//!
//! - [`dedup`]: generic cross-run diff/dedup algorithms (first-seen merge,
//!   value diff, bounded sampling)
//! - [`allowlist`]: exact/regex finding suppression
//! - [`probe`]: bounded fork-join HTTP redirect probing
//! - one module per built-in rule: [`ami`], [`secgroups`], [`elbs`],
//!   [`instancetags`], [`iam`], [`route53`], [`sso`], [`s3acl`]
//!
//! # Contract
//!
//! Rules move through `uninitialized -> initialized -> executed` within one
//! process invocation. [`Rule::init`] receives [`RuleContext`] with every
//! collaborator, always -- rules ignore what they don't need. It must
//! default missing persisted-state keys without overwriting existing ones.
//! [`Rule::execute`] returns a materialized `Vec<Finding>`, never a lazy
//! iterator.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};

use driftwatch_core::error::{DriftwatchError, RuleError};
use driftwatch_core::{BoxFuture, Finding, StateNamespace};
use driftwatch_enrich::InstanceEnricher;
use driftwatch_snapshot::SnapshotClient;

pub mod allowlist;
pub mod dedup;
pub mod probe;

pub mod ami;
pub mod elbs;
pub mod iam;
pub mod instancetags;
pub mod route53;
pub mod s3acl;
pub mod secgroups;
pub mod sso;

// --- Public API re-exports ---

pub use allowlist::AllowList;
pub use ami::NewAmiRule;
pub use elbs::LoadBalancerRule;
pub use iam::IamUserRule;
pub use instancetags::{MissingTagRule, NewTagRule};
pub use probe::{HttpRedirectProber, ProbeOutcome, RedirectProber};
pub use route53::Route53UnknownRule;
pub use s3acl::{Grant, Listing, ObjectStore, S3AclRule};
pub use secgroups::SecurityGroupRule;
pub use sso::SsoUnprotectedRule;

/// Everything a rule may need, passed to every rule identically.
#[derive(Clone)]
pub struct RuleContext {
    /// Snapshot client, pre-windowed to the run's `[since, until)` range.
    pub client: SnapshotClient,
    /// The rule's `plugin.<name>` options object.
    pub config: Map<String, Value>,
    /// The rule's private persisted-state namespace.
    pub state: StateNamespace,
    /// Shared enrichment engine for the run.
    pub enricher: Arc<InstanceEnricher>,
}

/// The rule-plugin trait.
pub trait Rule: Send + Sync {
    /// Stable rule name; also the config/state namespace suffix.
    fn name(&self) -> &'static str;

    /// Bind collaborators, parse configuration, default persisted-state
    /// keys. Called exactly once per invocation, before `execute`.
    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError>;

    /// Run the rule's predicate and return its findings.
    fn execute(&mut self) -> impl Future<Output = Result<Vec<Finding>, DriftwatchError>> + Send;
}

/// dyn-compatible mirror of [`Rule`].
///
/// `Rule::execute` uses RPITIT, so `dyn Rule` is not possible; `DynRule`
/// returns a `BoxFuture` and allows `Vec<Box<dyn DynRule>>` registries.
pub trait DynRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError>;
    fn execute(&mut self) -> BoxFuture<'_, Result<Vec<Finding>, DriftwatchError>>;
}

impl<T: Rule> DynRule for T {
    fn name(&self) -> &'static str {
        Rule::name(self)
    }

    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
        Rule::init(self, ctx)
    }

    fn execute(&mut self) -> BoxFuture<'_, Result<Vec<Finding>, DriftwatchError>> {
        Box::pin(Rule::execute(self))
    }
}

/// All built-in rules, in their canonical execution order.
pub fn builtin_rules() -> Vec<Box<dyn DynRule>> {
    vec![
        Box::new(SecurityGroupRule::new()),
        Box::new(NewAmiRule::new()),
        Box::new(LoadBalancerRule::new()),
        Box::new(NewTagRule::new()),
        Box::new(MissingTagRule::new()),
        Box::new(IamUserRule::new()),
        Box::new(S3AclRule::new()),
        Box::new(Route53UnknownRule::new()),
        Box::new(SsoUnprotectedRule::new()),
    ]
}

pub(crate) fn not_initialized(name: &str) -> RuleError {
    RuleError::NotInitialized {
        name: name.to_owned(),
    }
}

// --- small config-shape helpers shared by the rules ---

pub(crate) fn config_str_list(config: &Map<String, Value>, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn config_i64_list(config: &Map<String, Value>, key: &str) -> Option<Vec<i64>> {
    config.get(key).and_then(Value::as_array).map(|items| {
        items.iter().filter_map(Value::as_i64).collect()
    })
}

//! `sso_unprotected` rule -- externally hosted domains reachable without
//! the SSO gateway in front of them.
//!
//! External DNS names are probed over both http and https. Probe
//! outcomes are value-diffed against the persisted map, and a location
//! alerts only when it answers without redirecting. Plain http to https
//! upgrades on the same host are not treated as a missing gateway.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::info;

use driftwatch_core::Finding;
use driftwatch_core::StateNamespace;
use driftwatch_core::error::{DriftwatchError, RuleError};
use driftwatch_snapshot::SnapshotClient;

use crate::probe::{HttpRedirectProber, RedirectProber};
use crate::route53::{is_external, load_known_ips, load_route53_entries};
use crate::{Rule, RuleContext, config_str_list, not_initialized};

const NAME: &str = "sso_unprotected";

const UNPROTECTED: &str = "unprotected";

pub struct SsoUnprotectedRule {
    client: Option<SnapshotClient>,
    state: Option<StateNamespace>,
    prober: Arc<dyn RedirectProber>,
    sso_url: String,
    zone: Option<String>,
    legit_domains: Vec<String>,
    exception_domains: Vec<String>,
}

impl SsoUnprotectedRule {
    pub fn new() -> Self {
        Self::with_prober(Arc::new(HttpRedirectProber::default()))
    }

    /// Build with an injected prober (tests).
    pub fn with_prober(prober: Arc<dyn RedirectProber>) -> Self {
        Self {
            client: None,
            state: None,
            prober,
            sso_url: String::new(),
            zone: None,
            legit_domains: Vec::new(),
            exception_domains: Vec::new(),
        }
    }
}

impl Rule for SsoUnprotectedRule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
        self.sso_url = ctx
            .config
            .get("sso_url")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RuleError::BadConfig {
                name: NAME.to_owned(),
                reason: "missing 'sso_url'".to_owned(),
            })?;
        self.zone = ctx
            .config
            .get("zone")
            .and_then(Value::as_str)
            .map(str::to_owned);
        self.legit_domains = config_str_list(&ctx.config, "legit_domains");
        self.exception_domains = config_str_list(&ctx.config, "exception_domains");
        ctx.state.ensure("redirects", json!({}));
        self.client = Some(ctx.client);
        self.state = Some(ctx.state);
        Ok(())
    }

    async fn execute(&mut self) -> Result<Vec<Finding>, DriftwatchError> {
        let client = self.client.as_ref().ok_or_else(|| not_initialized(NAME))?;
        let state = self.state.as_ref().ok_or_else(|| not_initialized(NAME))?;

        let known_ips = load_known_ips(client).await?;
        let entries = load_route53_entries(client, self.zone.as_deref()).await?;

        let external_names: Vec<&str> = entries
            .iter()
            .filter(|e| is_external(e, &known_ips, &self.legit_domains))
            .filter_map(|e| e.get("name").and_then(Value::as_str))
            .filter(|name| !self.exception_domains.iter().any(|x| x == name))
            .collect();

        let locations: Vec<String> = external_names
            .iter()
            .flat_map(|name| [format!("http://{name}"), format!("https://{name}")])
            .collect();
        info!(locations = locations.len(), "probing external domains");
        let outcomes = self.prober.probe_all(locations).await;

        let current: BTreeMap<String, String> = outcomes
            .iter()
            .map(|(loc, outcome)| (loc.clone(), outcome.to_state_value()))
            .collect();
        let changed: HashSet<String> = crate::dedup::diff_values(state, "redirects", &current)
            .into_iter()
            .map(|c| c.subject)
            .collect();

        let mut findings = Vec::new();
        for (location, redirect) in &current {
            let expected = format!("{}{}", self.sso_url, location);
            if !changed.contains(location) && *redirect == expected {
                continue;
            }
            if is_https_upgrade(location, redirect) {
                continue;
            }
            if redirect.as_str() == UNPROTECTED {
                findings.push(Finding::new(
                    NAME,
                    location.clone(),
                    vec![json!(format!(
                        "This domain ({location}) is neither behind SSO nor GODAUTH"
                    ))],
                ));
            }
        }
        Ok(findings)
    }
}

fn split_scheme(url: &str) -> Option<(&str, &str)> {
    url.split_once("://")
        .filter(|(scheme, _)| *scheme == "http" || *scheme == "https")
}

/// Plain http answered with a redirect to https on the same host.
fn is_https_upgrade(location: &str, redirect: &str) -> bool {
    match (split_scheme(location), split_scheme(redirect)) {
        (Some((loc_scheme, loc_host)), Some((red_scheme, red_host))) => {
            loc_host == red_host && loc_scheme == "http" && red_scheme == "https"
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DynRule;
    use crate::probe::tests::TableProber;
    use crate::probe::ProbeOutcome;
    use crate::testutil::{MockTransport, context};
    use std::collections::HashMap;

    const RECORDS_URL: &str = "http://svc/api/v2/aws/hostedRecords;_expand";
    const INSTANCES_URL: &str = "http://svc/api/v2/view/instances;_expand";

    fn transport_with(names: &[&str]) -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport.respond(INSTANCES_URL, "[]");
        let entries: Vec<Value> = names
            .iter()
            .map(|n| {
                json!({"name": n, "type": "CNAME",
                       "resourceRecords": [{"value": "somewhere.external.net"}]})
            })
            .collect();
        transport.respond(RECORDS_URL, &json!(entries).to_string());
        transport
    }

    async fn run(
        transport: &Arc<MockTransport>,
        table: HashMap<String, ProbeOutcome>,
        config: Value,
        state: StateNamespace,
    ) -> Vec<Finding> {
        let mut rule = SsoUnprotectedRule::with_prober(Arc::new(TableProber { table }));
        Rule::init(&mut rule, context(transport, config, state)).unwrap();
        DynRule::execute(&mut rule).await.unwrap()
    }

    fn sso_config() -> Value {
        json!({"sso_url": "https://sso.example.com/?o="})
    }

    #[tokio::test]
    async fn missing_sso_url_is_a_config_error() {
        let transport = transport_with(&[]);
        let mut rule = SsoUnprotectedRule::with_prober(Arc::new(TableProber {
            table: HashMap::new(),
        }));
        let err = Rule::init(&mut rule, context(&transport, json!({}), StateNamespace::default()))
            .unwrap_err();
        assert!(err.to_string().contains("sso_url"));
    }

    #[tokio::test]
    async fn unprotected_domain_alerts_on_both_schemes() {
        let transport = transport_with(&["open.example.com"]);
        let table = HashMap::from([
            ("http://open.example.com".to_owned(), ProbeOutcome::NoRedirect),
            ("https://open.example.com".to_owned(), ProbeOutcome::NoRedirect),
        ]);
        let state = StateNamespace::default();

        let findings = run(&transport, table, sso_config(), state.clone()).await;

        assert_eq!(findings.len(), 2);
        assert!(findings[0]
            .details[0]
            .as_str()
            .unwrap()
            .contains("is neither behind SSO nor GODAUTH"));

        let persisted = state.get_str_map("redirects");
        assert_eq!(
            persisted.get("http://open.example.com"),
            Some(&"unprotected".to_owned())
        );
    }

    #[tokio::test]
    async fn gateway_protected_domain_is_quiet() {
        let transport = transport_with(&["safe.example.com"]);
        let table = HashMap::from([
            (
                "http://safe.example.com".to_owned(),
                ProbeOutcome::Redirect("https://sso.example.com/?o=http://safe.example.com".to_owned()),
            ),
            (
                "https://safe.example.com".to_owned(),
                ProbeOutcome::Redirect("https://sso.example.com/?o=https://safe.example.com".to_owned()),
            ),
        ]);
        let findings = run(&transport, table, sso_config(), StateNamespace::default()).await;
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn https_upgrade_on_same_host_is_quiet() {
        let transport = transport_with(&["tls.example.com"]);
        let table = HashMap::from([
            (
                "http://tls.example.com".to_owned(),
                ProbeOutcome::Redirect("https://tls.example.com".to_owned()),
            ),
            (
                "https://tls.example.com".to_owned(),
                ProbeOutcome::Redirect("https://sso.example.com/?o=https://tls.example.com".to_owned()),
            ),
        ]);
        let findings = run(&transport, table, sso_config(), StateNamespace::default()).await;
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn unreachable_domain_is_quiet() {
        let transport = transport_with(&["down.example.com"]);
        let findings = run(
            &transport,
            HashMap::new(),
            sso_config(),
            StateNamespace::default(),
        )
        .await;
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn exception_domains_are_never_probed() {
        let transport = transport_with(&["exempt.example.com"]);
        let mut config = sso_config();
        config["exception_domains"] = json!(["exempt.example.com"]);
        let state = StateNamespace::default();
        let findings = run(&transport, HashMap::new(), config, state.clone()).await;
        assert!(findings.is_empty());
        assert!(state.get_str_map("redirects").is_empty());
    }

    #[tokio::test]
    async fn unchanged_unprotected_domain_still_realerts() {
        // A domain that stays unprotected keeps failing the gateway
        // expectation, so it alerts on every run until it is fixed.
        let transport = transport_with(&["open.example.com"]);
        let table = HashMap::from([
            ("http://open.example.com".to_owned(), ProbeOutcome::NoRedirect),
            ("https://open.example.com".to_owned(), ProbeOutcome::NoRedirect),
        ]);
        let state = StateNamespace::default();
        run(&transport, table.clone(), sso_config(), state.clone()).await;

        let transport = transport_with(&["open.example.com"]);
        let findings = run(&transport, table, sso_config(), state).await;
        assert_eq!(findings.len(), 2);
    }
}

//! `route53unknown` rule -- DNS records pointing outside the known
//! infrastructure.
//!
//! A record is external when none of its values resolve to a known
//! public IP, a legit domain suffix, or an `ec2-` hostname that decodes
//! to a known IP. Known-set dedup: previously reported `name-record`
//! pairs are suppressed, and the persisted set is replaced wholesale
//! every run.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Value, json};

use driftwatch_core::Finding;
use driftwatch_core::error::{DriftwatchError, SnapshotError};
use driftwatch_core::StateNamespace;
use driftwatch_snapshot::SnapshotClient;

use crate::{Rule, RuleContext, config_str_list, not_initialized};

const NAME: &str = "route53unknown";

/// Fetch all hosted DNS records (optionally narrowed to one zone),
/// deduplicated by record name with the last occurrence winning.
pub(crate) async fn load_route53_entries(
    client: &SnapshotClient,
    zone: Option<&str>,
) -> Result<Vec<Value>, SnapshotError> {
    let selector = zone
        .map(|z| format!(";zone.name={z}"))
        .unwrap_or_default();
    let raw = client
        .clean()
        .query(&format!("/api/v2/aws/hostedRecords{selector};_expand"))
        .await?;

    let mut by_name: BTreeMap<String, Value> = BTreeMap::new();
    for entry in raw.as_array().into_iter().flatten() {
        let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
        by_name.insert(name.to_owned(), entry.clone());
    }
    Ok(by_name.into_values().collect())
}

pub(crate) fn record_values(entry: &Value) -> Vec<&str> {
    entry
        .get("resourceRecords")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("value").and_then(Value::as_str))
        .collect()
}

/// Whether any of the entry's values points outside the known estate.
pub(crate) fn is_external(
    entry: &Value,
    known_ips: &HashSet<String>,
    legit_domains: &[String],
) -> bool {
    record_values(entry)
        .iter()
        .any(|r| is_ip_unknown(r, known_ips) && is_cname_unknown(r, known_ips, legit_domains))
}

fn is_ip_unknown(record: &str, known_ips: &HashSet<String>) -> bool {
    !known_ips.contains(record)
}

fn is_cname_unknown(record: &str, known_ips: &HashSet<String>, legit_domains: &[String]) -> bool {
    if legit_domains.iter().any(|d| record.ends_with(d)) {
        return false;
    }
    // ec2-54-12-0-3.compute-1.amazonaws.com encodes the public IP.
    if let Some(encoded) = record.strip_prefix("ec2-") {
        if let Some(end) = encoded.find(".compute") {
            let ip = encoded[..end].replace('-', ".");
            return is_ip_unknown(&ip, known_ips);
        }
    }
    true
}

/// Public instance IPs from the inventory, the baseline of "known".
pub(crate) async fn load_known_ips(
    client: &SnapshotClient,
) -> Result<HashSet<String>, SnapshotError> {
    let machines = client
        .soft_clean()
        .query("/api/v2/view/instances;_expand")
        .await?;
    Ok(machines
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|m| m.get("publicIpAddress").and_then(Value::as_str))
        .map(str::to_owned)
        .collect())
}

#[derive(Default)]
pub struct Route53UnknownRule {
    client: Option<SnapshotClient>,
    state: Option<StateNamespace>,
    zone: Option<String>,
    legit_domains: Vec<String>,
}

impl Route53UnknownRule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Rule for Route53UnknownRule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
        self.zone = ctx
            .config
            .get("zone")
            .and_then(Value::as_str)
            .map(str::to_owned);
        self.legit_domains = config_str_list(&ctx.config, "legit_domains");
        ctx.state.ensure("known", json!([]));
        self.client = Some(ctx.client);
        self.state = Some(ctx.state);
        Ok(())
    }

    async fn execute(&mut self) -> Result<Vec<Finding>, DriftwatchError> {
        let client = self.client.as_ref().ok_or_else(|| not_initialized(NAME))?;
        let state = self.state.as_ref().ok_or_else(|| not_initialized(NAME))?;

        let known_ips = load_known_ips(client).await?;
        let entries = load_route53_entries(client, self.zone.as_deref()).await?;

        let mut alerts: Vec<(String, String)> = Vec::new();
        for entry in &entries {
            let kind = entry.get("type").and_then(Value::as_str).unwrap_or("");
            if kind != "A" && kind != "CNAME" {
                continue;
            }
            if !is_external(entry, &known_ips, &self.legit_domains) {
                continue;
            }
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>");
            for record in record_values(entry) {
                if is_ip_unknown(record, &known_ips)
                    && is_cname_unknown(record, &known_ips, &self.legit_domains)
                {
                    alerts.push((name.to_owned(), record.to_owned()));
                }
            }
        }

        let previously_known: HashSet<String> =
            state.get_str_list("known").into_iter().collect();
        let current_keys: Vec<String> = alerts
            .iter()
            .map(|(name, record)| format!("{name}-{record}"))
            .collect();

        let findings = alerts
            .iter()
            .zip(&current_keys)
            .filter(|(_, key)| !previously_known.contains(*key))
            .map(|((name, record), _)| {
                Finding::new(NAME, name.clone(), vec![json!(record)])
            })
            .collect();

        // Wholesale replacement: entries that stop alerting drop out and
        // will re-alert if they ever come back.
        state.set_str_list("known", &current_keys);
        Ok(findings)
    }
}

//! `newtag` and `missingtag` rules -- service-name tag hygiene over the
//! instance inventory.
//!
//! `newtag` flags a `service_name` value whose every bearer launched
//! inside the window (a brand-new service). `missingtag` flags instances
//! launched inside the window without any `service_name` tag at all,
//! reporting each offender as an enriched machine summary so the alert
//! identifies the unlabeled workload.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use driftwatch_core::Finding;
use driftwatch_core::error::DriftwatchError;
use driftwatch_enrich::{InstanceEnricher, launch_time_ms};
use driftwatch_snapshot::SnapshotClient;

use crate::{Rule, RuleContext, not_initialized};

const SERVICE_TAG: &str = "service_name";

fn service_tags(machine: &Value) -> Vec<&str> {
    machine
        .get("tags")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|t| t.get("key").and_then(Value::as_str) == Some(SERVICE_TAG))
        .filter_map(|t| t.get("value").and_then(Value::as_str))
        .collect()
}

// ---- newtag ----

#[derive(Default)]
pub struct NewTagRule {
    client: Option<SnapshotClient>,
}

impl NewTagRule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Rule for NewTagRule {
    fn name(&self) -> &'static str {
        "newtag"
    }

    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
        self.client = Some(ctx.client);
        Ok(())
    }

    async fn execute(&mut self) -> Result<Vec<Finding>, DriftwatchError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| not_initialized("newtag"))?;
        let since = client.window_since().unwrap_or(0);
        let machines = client.clean().query("/api/v2/view/instances;_expand").await?;

        let mut grouped: BTreeMap<String, Vec<(String, i64)>> = BTreeMap::new();
        for machine in machines.as_array().into_iter().flatten() {
            let instance_id = machine
                .get("instanceId")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned();
            let launch = launch_time_ms(machine);
            for tag in service_tags(machine) {
                grouped
                    .entry(tag.to_owned())
                    .or_default()
                    .push((instance_id.clone(), launch));
            }
        }

        let findings = grouped
            .into_iter()
            .filter(|(_, instances)| instances.iter().all(|(_, launch)| *launch >= since))
            .map(|(tag, instances)| {
                let ids: Vec<&str> = instances.iter().map(|(id, _)| id.as_str()).collect();
                Finding::new("newtag", tag, vec![json!(ids.join(", "))])
            })
            .collect();
        Ok(findings)
    }
}

// ---- missingtag ----

#[derive(Default)]
pub struct MissingTagRule {
    client: Option<SnapshotClient>,
    enricher: Option<Arc<InstanceEnricher>>,
}

impl MissingTagRule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Rule for MissingTagRule {
    fn name(&self) -> &'static str {
        "missingtag"
    }

    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
        self.client = Some(ctx.client);
        self.enricher = Some(ctx.enricher);
        Ok(())
    }

    async fn execute(&mut self) -> Result<Vec<Finding>, DriftwatchError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| not_initialized("missingtag"))?;
        let enricher = self
            .enricher
            .as_ref()
            .ok_or_else(|| not_initialized("missingtag"))?;
        let since = client.window_since().unwrap_or(0);
        let machines = client.clean().query("/api/v2/view/instances;_expand").await?;

        let mut findings = Vec::new();
        for machine in machines.as_array().into_iter().flatten() {
            if launch_time_ms(machine) <= since || !service_tags(machine).is_empty() {
                continue;
            }
            let id = machine
                .get("instanceId")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned();
            let mut record = machine.clone();
            let report = enricher.report(&mut record, &Map::new());
            findings.push(Finding::new("missingtag", id, vec![Value::Object(report)]));
        }
        Ok(findings)
    }
}

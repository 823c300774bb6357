//! `ami` rule -- alerts when instances start from a machine image never
//! seen before the current window.
//!
//! First-seen tracking over instances grouped by image id: the persisted
//! per-image minimum launch time is merged with the current snapshot's
//! minimum, and a group alerts only when the merged minimum falls inside
//! the window. Instances carrying an allow-listed `service_name` tag are
//! suppressed per finding.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde_json::{Value, json};

use driftwatch_core::error::DriftwatchError;
use driftwatch_core::{Finding, StateNamespace};
use driftwatch_enrich::launch_time_ms;
use driftwatch_snapshot::SnapshotClient;

use crate::dedup::merge_first_seen;
use crate::{Rule, RuleContext, config_str_list, not_initialized};

const NAME: &str = "ami";

/// Tag keys carried into finding details.
const DETAIL_TAGS: [&str; 2] = ["service_name", "started_by"];

#[derive(Default)]
pub struct NewAmiRule {
    client: Option<SnapshotClient>,
    state: Option<StateNamespace>,
    allowed_services: Vec<String>,
}

impl NewAmiRule {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_allow_listed(&self, tags: &[Value]) -> bool {
        tags.iter().any(|tag| {
            tag.get("service_name")
                .and_then(Value::as_str)
                .is_some_and(|service| self.allowed_services.iter().any(|a| a == service))
        })
    }
}

impl Rule for NewAmiRule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
        self.allowed_services = config_str_list(&ctx.config, "allowed_tags");
        ctx.state.ensure(crate::dedup::FIRST_SEEN_KEY, json!({}));
        self.client = Some(ctx.client);
        self.state = Some(ctx.state);
        Ok(())
    }

    async fn execute(&mut self) -> Result<Vec<Finding>, DriftwatchError> {
        let client = self.client.as_ref().ok_or_else(|| not_initialized(NAME))?;
        let state = self.state.as_ref().ok_or_else(|| not_initialized(NAME))?;
        let since = client.window_since().unwrap_or(0);

        // The grouping must see the whole inventory, not just the window.
        let machines = client.clean().query("/api/v2/view/instances;_expand").await?;

        let mut grouped: BTreeMap<String, Vec<(String, i64, Vec<Value>)>> = BTreeMap::new();
        for machine in machines.as_array().into_iter().flatten() {
            let Some(image_id) = machine.get("imageId").and_then(Value::as_str) else {
                continue;
            };
            let instance_id = machine
                .get("instanceId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let tags = machine
                .get("tags")
                .and_then(Value::as_array)
                .map(|tags| {
                    tags.iter()
                        .filter(|t| {
                            t.get("key")
                                .and_then(Value::as_str)
                                .is_some_and(|k| DETAIL_TAGS.contains(&k))
                        })
                        .filter_map(|t| {
                            let key = t.get("key")?.as_str()?;
                            let value = t.get("value").cloned().unwrap_or(Value::Null);
                            Some(json!({key: value}))
                        })
                        .collect()
                })
                .unwrap_or_default();
            grouped.entry(image_id.to_owned()).or_default().push((
                instance_id,
                launch_time_ms(machine),
                tags,
            ));
        }

        let current_min: HashMap<String, i64> = grouped
            .iter()
            .filter_map(|(image_id, instances)| {
                instances
                    .iter()
                    .map(|(_, launch, _)| *launch)
                    .min()
                    .map(|min| (image_id.clone(), min))
            })
            .collect();
        let merged = merge_first_seen(state, &current_min);

        let mut findings = Vec::new();
        for (image_id, instances) in &grouped {
            if merged.get(image_id).copied().unwrap_or(i64::MIN) < since {
                continue;
            }
            let details: Vec<Value> = instances
                .iter()
                .filter(|(_, launch, tags)| *launch >= since && !self.is_allow_listed(tags))
                .map(|(instance_id, launch, tags)| {
                    json!({"instanceId": instance_id, "launchTime": launch, "tags": tags})
                })
                .collect();
            if !details.is_empty() {
                findings.push(Finding::new(NAME, image_id.clone(), details));
            }
        }
        Ok(findings)
    }
}

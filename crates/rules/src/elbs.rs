//! `elbs` rule -- load balancers listening on ports outside the allow
//! list.

use serde_json::{Value, json};

use driftwatch_core::Finding;
use driftwatch_core::error::DriftwatchError;
use driftwatch_snapshot::SnapshotClient;

use crate::{Rule, RuleContext, config_i64_list, not_initialized};

const NAME: &str = "elbs";

#[derive(Default)]
pub struct LoadBalancerRule {
    client: Option<SnapshotClient>,
    allowed_ports: Vec<i64>,
}

impl LoadBalancerRule {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_suspicious(&self, elb: &Value) -> bool {
        elb.get("listenerDescriptions")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .any(|desc| {
                desc.get("listener")
                    .and_then(|l| l.get("loadBalancerPort"))
                    .and_then(Value::as_i64)
                    .is_some_and(|port| !self.allowed_ports.contains(&port))
            })
    }
}

impl Rule for LoadBalancerRule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
        self.allowed_ports = config_i64_list(&ctx.config, "allowed_ports").unwrap_or_default();
        self.client = Some(ctx.client);
        Ok(())
    }

    async fn execute(&mut self) -> Result<Vec<Finding>, DriftwatchError> {
        let client = self.client.as_ref().ok_or_else(|| not_initialized(NAME))?;
        let elbs = client
            .updated_only()
            .query("/api/v2/aws/loadBalancers;_expand")
            .await?;

        let findings = elbs
            .as_array()
            .into_iter()
            .flatten()
            .filter(|elb| self.is_suspicious(elb))
            .map(|elb| {
                let name = elb
                    .get("loadBalancerName")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned();
                let member_count = elb
                    .get("instances")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                let detail = json!({
                    "canonicalHostedZoneName":
                        elb.get("canonicalHostedZoneName").cloned().unwrap_or(Value::Null),
                    "numberOfInstances": member_count,
                    "listenerDescriptions":
                        elb.get("listenerDescriptions").cloned().unwrap_or(Value::Null),
                });
                Finding::new(NAME, name, vec![detail])
            })
            .collect();
        Ok(findings)
    }
}

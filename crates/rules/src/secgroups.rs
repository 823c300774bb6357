//! `secgroups` rule -- security groups opening suspicious port ranges to
//! the world.
//!
//! A permission is suspicious when its protocol is not allow-listed, its
//! ranges include `0.0.0.0/0`, and the port span is not a single
//! allow-listed port. VPC groups are skipped. Each finding carries the
//! affected instances and a best-effort TCP reachability verdict.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpStream;
use tracing::debug;

use driftwatch_core::error::DriftwatchError;
use driftwatch_core::Finding;
use driftwatch_snapshot::SnapshotClient;

use crate::{Rule, RuleContext, config_i64_list, config_str_list, not_initialized};

const NAME: &str = "secgroups";

const SUSPICIOUS_RANGE: &str = "0.0.0.0/0";

/// Port spans wider than this are reported without probing.
const MAX_PROBE_SPAN: i64 = 20;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct SecurityGroupRule {
    client: Option<SnapshotClient>,
    allowed_protocols: Vec<String>,
    allowed_ports: Vec<i64>,
}

impl SecurityGroupRule {
    pub fn new() -> Self {
        Self {
            client: None,
            allowed_protocols: vec!["icmp".to_owned()],
            allowed_ports: vec![22],
        }
    }

    fn is_suspicious(&self, perm: &Value) -> bool {
        let proto_ok = perm
            .get("ipProtocol")
            .and_then(Value::as_str)
            .is_some_and(|p| self.allowed_protocols.iter().any(|a| a == p));
        let range_nok = perm
            .get("ipRanges")
            .and_then(Value::as_array)
            .is_some_and(|ranges| ranges.iter().any(|r| r.as_str() == Some(SUSPICIOUS_RANGE)));
        if proto_ok || !range_nok {
            return false;
        }
        // fromPort and toPort define the inbound range; fromPort is not
        // the peer's source port.
        let from = perm.get("fromPort").and_then(Value::as_i64).unwrap_or(-1);
        let to = perm.get("toPort").and_then(Value::as_i64).unwrap_or(65536);
        from != to || !self.allowed_ports.contains(&from)
    }
}

impl Default for SecurityGroupRule {
    fn default() -> Self {
        Self::new()
    }
}

impl Rule for SecurityGroupRule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
        if ctx.config.contains_key("allowed_protocols") {
            self.allowed_protocols = config_str_list(&ctx.config, "allowed_protocols");
        }
        if let Some(ports) = config_i64_list(&ctx.config, "allowed_ports") {
            self.allowed_ports = ports;
        }
        self.client = Some(ctx.client);
        Ok(())
    }

    async fn execute(&mut self) -> Result<Vec<Finding>, DriftwatchError> {
        let client = self.client.as_ref().ok_or_else(|| not_initialized(NAME))?;
        let groups = client
            .updated_only()
            .query("/api/v2/aws/securityGroups;_expand")
            .await?;
        let machines = client.query("/api/v2/view/instances;_expand").await?;
        let machines: &[Value] = machines.as_array().map(Vec::as_slice).unwrap_or_default();

        let mut findings = Vec::new();
        for group in groups.as_array().into_iter().flatten() {
            // VPC security groups have their own ingress model.
            if group.get("vpcId").is_some_and(|v| !v.is_null()) {
                continue;
            }
            let perms: Vec<&Value> = group
                .get("ipPermissions")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter(|p| self.is_suspicious(p))
                .collect();
            if perms.is_empty() {
                continue;
            }
            let group_id = group.get("groupId").and_then(Value::as_str).unwrap_or("");
            let group_name = group.get("groupName").and_then(Value::as_str).unwrap_or("");
            let affected = machines_with_group(machines, group_id);

            let mut details = Vec::with_capacity(perms.len());
            for perm in perms {
                details.push(perm_detail(perm, &affected).await);
            }
            findings.push(Finding::new(
                NAME,
                format!("{group_id} ({group_name})"),
                details,
            ));
        }
        Ok(findings)
    }
}

fn machines_with_group<'a>(machines: &'a [Value], group_id: &str) -> Vec<&'a Value> {
    machines
        .iter()
        .filter(|machine| {
            machine
                .get("securityGroups")
                .and_then(Value::as_array)
                .is_some_and(|sgs| {
                    sgs.iter()
                        .any(|sg| sg.get("groupId").and_then(Value::as_str) == Some(group_id))
                })
        })
        .collect()
}

async fn perm_detail(perm: &Value, affected: &[&Value]) -> Value {
    let summaries: Vec<String> = affected
        .iter()
        .map(|machine| {
            let id = machine
                .get("instanceId")
                .and_then(Value::as_str)
                .unwrap_or("");
            let ip = machine
                .get("publicIpAddress")
                .and_then(Value::as_str)
                .unwrap_or("");
            let tags = machine
                .get("tags")
                .and_then(Value::as_array)
                .map(|tags| {
                    tags.iter()
                        .filter_map(|t| t.get("value").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            format!("{id} ({ip}): {tags}")
        })
        .collect();

    let from = perm.get("fromPort").and_then(Value::as_i64);
    let to = perm.get("toPort").and_then(Value::as_i64);
    let host = affected
        .first()
        .and_then(|m| m.get("publicIpAddress"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let port_open = if affected.is_empty() {
        json!(false)
    } else {
        is_port_open(host, from, to)
            .await
            .map(Value::Bool)
            .unwrap_or(Value::Null)
    };

    json!({
        "port_open": port_open,
        "machines": summaries,
        "fromPort": perm.get("fromPort").cloned().unwrap_or(Value::Null),
        "toPort": perm.get("toPort").cloned().unwrap_or(Value::Null),
        "ipRanges": perm.get("ipRanges").cloned().unwrap_or(Value::Null),
        "ipProtocol": perm.get("ipProtocol").cloned().unwrap_or(Value::Null),
    })
}

/// Try connecting to every port in the range; `None` means the range was
/// too wide to probe.
async fn is_port_open(host: &str, from: Option<i64>, to: Option<i64>) -> Option<bool> {
    let (Some(from), Some(to)) = (from, to) else {
        return Some(false);
    };
    if host.is_empty() || !(0..=65535).contains(&from) || !(0..=65535).contains(&to) {
        return Some(false);
    }
    if (to - from).abs() > MAX_PROBE_SPAN {
        return None;
    }
    for port in from..=to {
        debug!(host, port, "probing tcp reachability");
        let attempt = tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port as u16)));
        if matches!(attempt.await, Ok(Ok(_))) {
            return Some(true);
        }
    }
    Some(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DynRule;
    use crate::testutil::{MockTransport, context};
    use driftwatch_core::StateNamespace;
    use std::sync::Arc;

    const GROUPS_URL: &str = "http://svc/api/v2/aws/securityGroups;_expand;_updated";
    const INSTANCES_URL: &str = "http://svc/api/v2/view/instances;_expand";

    async fn run(transport: &Arc<MockTransport>, config: Value) -> Vec<Finding> {
        let mut rule = SecurityGroupRule::new();
        Rule::init(&mut rule, context(transport, config, StateNamespace::default()))
            .unwrap();
        DynRule::execute(&mut rule).await.unwrap()
    }

    fn world_open_group(from: i64, to: i64) -> String {
        json!([{
            "groupId": "sg-1",
            "groupName": "web",
            "ipPermissions": [{
                "ipProtocol": "tcp",
                "fromPort": from,
                "toPort": to,
                "ipRanges": ["0.0.0.0/0"]
            }]
        }])
        .to_string()
    }

    #[tokio::test]
    async fn world_open_port_alerts_with_affected_machines() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(GROUPS_URL, &world_open_group(9000, 9000));
        transport.respond(
            INSTANCES_URL,
            r#"[
                {"instanceId": "i-1", "publicIpAddress": "",
                 "securityGroups": [{"groupId": "sg-1"}],
                 "tags": [{"key": "Name", "value": "web-1"}]},
                {"instanceId": "i-2", "publicIpAddress": "",
                 "securityGroups": [{"groupId": "sg-9"}], "tags": []}
            ]"#,
        );

        let findings = run(&transport, json!({})).await;

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].subject_id, "sg-1 (web)");
        assert_eq!(findings[0].details.len(), 1);
        let detail = &findings[0].details[0];
        assert_eq!(detail["machines"], json!(["i-1 (): web-1"]));
        assert_eq!(detail["fromPort"], 9000);
        // Empty host short-circuits the reachability probe.
        assert_eq!(detail["port_open"], false);
    }

    #[tokio::test]
    async fn allow_listed_single_port_is_quiet() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(GROUPS_URL, &world_open_group(22, 22));
        transport.respond(INSTANCES_URL, "[]");
        assert!(run(&transport, json!({})).await.is_empty());
    }

    #[tokio::test]
    async fn range_ending_on_allowed_port_still_alerts() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(GROUPS_URL, &world_open_group(20, 22));
        transport.respond(INSTANCES_URL, "[]");
        assert_eq!(run(&transport, json!({})).await.len(), 1);
    }

    #[tokio::test]
    async fn allowed_protocol_is_quiet() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            GROUPS_URL,
            &json!([{
                "groupId": "sg-2",
                "groupName": "ping",
                "ipPermissions": [{
                    "ipProtocol": "icmp",
                    "fromPort": -1,
                    "toPort": -1,
                    "ipRanges": ["0.0.0.0/0"]
                }]
            }])
            .to_string(),
        );
        transport.respond(INSTANCES_URL, "[]");
        assert!(run(&transport, json!({})).await.is_empty());
    }

    #[tokio::test]
    async fn private_range_is_quiet() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            GROUPS_URL,
            &json!([{
                "groupId": "sg-3",
                "groupName": "internal",
                "ipPermissions": [{
                    "ipProtocol": "tcp",
                    "fromPort": 5432,
                    "toPort": 5432,
                    "ipRanges": ["10.0.0.0/8"]
                }]
            }])
            .to_string(),
        );
        transport.respond(INSTANCES_URL, "[]");
        assert!(run(&transport, json!({})).await.is_empty());
    }

    #[tokio::test]
    async fn vpc_groups_are_skipped() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            GROUPS_URL,
            &json!([{
                "groupId": "sg-4",
                "groupName": "vpc-open",
                "vpcId": "vpc-1",
                "ipPermissions": [{
                    "ipProtocol": "tcp",
                    "fromPort": 80,
                    "toPort": 80,
                    "ipRanges": ["0.0.0.0/0"]
                }]
            }])
            .to_string(),
        );
        transport.respond(INSTANCES_URL, "[]");
        assert!(run(&transport, json!({})).await.is_empty());
    }

    #[tokio::test]
    async fn config_overrides_allowed_ports() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(GROUPS_URL, &world_open_group(9000, 9000));
        transport.respond(INSTANCES_URL, "[]");
        let findings = run(&transport, json!({"allowed_ports": [22, 9000]})).await;
        assert!(findings.is_empty());
    }
}

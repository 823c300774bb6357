//! driftwatch-enrich -- joins raw instance records against precomputed
//! load-balancer and security-group lookup tables.
//!
//! The two lookup caches are built eagerly, exactly once, when the engine
//! is constructed; enriching a record afterwards is a pure in-memory join.
//! The caches are immutable for the engine's lifetime -- a fresh view of
//! the inventory requires a new engine.

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use driftwatch_core::error::SnapshotError;
use driftwatch_snapshot::SnapshotClient;

/// Tag keys scanned, in priority order, to derive a service type.
const SERVICE_TYPE_TAGS: [&str; 3] = ["service_name", "Name", "aws:autoscaling:groupName"];

/// A load balancer reduced to what enrichment needs.
#[derive(Debug, Clone, Serialize)]
pub struct ElbSummary {
    #[serde(rename = "DNSName")]
    pub dns_name: Option<String>,
    pub instances: Vec<String>,
    pub ports: Vec<Value>,
}

/// The enrichment engine.
pub struct InstanceEnricher {
    elbs: Vec<ElbSummary>,
    security_group_rules: Map<String, Value>,
}

impl InstanceEnricher {
    /// Build the engine, paying the lookup-cache construction cost once.
    ///
    /// Queries run on a `soft_clean` derivation of the given client: no
    /// window modifiers (the caches must cover the whole inventory), but
    /// the shared response cache is kept.
    pub async fn build(client: &SnapshotClient) -> Result<Self, SnapshotError> {
        let client = client.soft_clean();
        let elbs = Self::load_balancers(&client).await?;
        let security_group_rules = Self::security_group_rules(&client).await?;
        debug!(
            elbs = elbs.len(),
            groups = security_group_rules.len(),
            "enrichment caches built"
        );
        Ok(Self {
            elbs,
            security_group_rules,
        })
    }

    /// Build directly from already-materialized records (tests).
    pub fn from_records(elbs: &[Value], groups: &[Value]) -> Self {
        Self {
            elbs: elbs.iter().filter_map(clean_elb).collect(),
            security_group_rules: groups
                .iter()
                .filter_map(|g| {
                    let id = g.get("groupId")?.as_str()?;
                    Some((id.to_owned(), Value::Array(flatten_permissions(g))))
                })
                .collect(),
        }
    }

    async fn load_balancers(client: &SnapshotClient) -> Result<Vec<ElbSummary>, SnapshotError> {
        let raw = client.query("/api/v2/aws/loadBalancers;_expand").await?;
        let elbs = raw
            .as_array()
            .map(|list| list.iter().filter_map(clean_elb).collect())
            .unwrap_or_default();
        Ok(elbs)
    }

    async fn security_group_rules(
        client: &SnapshotClient,
    ) -> Result<Map<String, Value>, SnapshotError> {
        let raw = client.query("/api/v2/aws/securityGroups;_expand").await?;
        let mut rules = Map::new();
        for group in raw.as_array().into_iter().flatten() {
            let Some(id) = group.get("groupId").and_then(Value::as_str) else {
                continue;
            };
            rules.insert(id.to_owned(), Value::Array(flatten_permissions(group)));
        }
        Ok(rules)
    }

    /// Enrich an instance record in place: `service_type`, member `elbs`,
    /// and per-security-group `rules`.
    pub fn enrich(&self, instance: &mut Value) {
        let instance_id = instance
            .get("instanceId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let service_type = instance
            .get("tags")
            .and_then(Value::as_array)
            .and_then(|tags| service_type_from_tags(tags))
            .unwrap_or_else(|| instance_id.clone());

        let member_elbs: Vec<Value> = self
            .elbs
            .iter()
            .filter(|elb| elb.instances.iter().any(|i| i == &instance_id))
            .filter_map(|elb| serde_json::to_value(elb).ok())
            .collect();

        if let Some(obj) = instance.as_object_mut() {
            obj.insert("service_type".to_owned(), Value::from(service_type));
            obj.insert("elbs".to_owned(), Value::Array(member_elbs));
        }

        if let Some(groups) = instance
            .get_mut("securityGroups")
            .and_then(Value::as_array_mut)
        {
            for group in groups {
                let rules = group
                    .get("groupId")
                    .and_then(Value::as_str)
                    .and_then(|id| self.security_group_rules.get(id))
                    .cloned()
                    .unwrap_or_else(|| Value::Array(Vec::new()));
                if let Some(obj) = group.as_object_mut() {
                    obj.insert("rules".to_owned(), rules);
                }
            }
        }
    }

    /// Enrich, then project the normalized report fields, merged with
    /// caller-supplied extras (extras win on key collision).
    pub fn report(&self, instance: &mut Value, extra: &Map<String, Value>) -> Map<String, Value> {
        self.enrich(instance);

        let open_ports: Vec<Value> = instance
            .get("securityGroups")
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .map(|g| g.get("rules").cloned().unwrap_or(Value::Array(Vec::new())))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = Map::new();
        report.insert(
            "instanceId".to_owned(),
            instance.get("instanceId").cloned().unwrap_or(Value::Null),
        );
        report.insert("started".to_owned(), json!(launch_time_ms(instance)));
        report.insert(
            "service_type".to_owned(),
            instance.get("service_type").cloned().unwrap_or(Value::Null),
        );
        report.insert(
            "elbs".to_owned(),
            instance.get("elbs").cloned().unwrap_or(Value::Array(Vec::new())),
        );
        report.insert("open_ports".to_owned(), Value::Array(open_ports));
        report.insert(
            "publicIpAddress".to_owned(),
            instance.get("publicIpAddress").cloned().unwrap_or(Value::Null),
        );
        report.insert(
            "privateIpAddress".to_owned(),
            instance.get("privateIpAddress").cloned().unwrap_or(Value::Null),
        );
        report.insert(
            "keyName".to_owned(),
            instance.get("keyName").cloned().unwrap_or(Value::Null),
        );
        report.insert(
            "region".to_owned(),
            region_of(instance).map(Value::from).unwrap_or(Value::Null),
        );

        for (key, value) in extra {
            report.insert(key.clone(), value.clone());
        }
        report
    }
}

/// Launch time of an instance in epoch ms, tolerating both numeric and
/// string encodings; 0 when absent.
pub fn launch_time_ms(instance: &Value) -> i64 {
    match instance.get("launchTime") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Region derived from the placement availability zone by stripping the
/// trailing zone letter (`us-east-1a` -> `us-east-1`).
fn region_of(instance: &Value) -> Option<String> {
    let zone = instance
        .get("placement")?
        .get("availabilityZone")?
        .as_str()?;
    Some(zone.trim_end_matches(|c: char| c.is_ascii_alphabetic()).to_owned())
}

fn service_type_from_tags(tags: &[Value]) -> Option<String> {
    for wanted in SERVICE_TYPE_TAGS {
        for tag in tags {
            if tag.get("key").and_then(Value::as_str) == Some(wanted) {
                return tag.get("value").and_then(Value::as_str).map(str::to_owned);
            }
        }
    }
    None
}

/// Reduce a raw load-balancer record; LBs without members are dropped.
fn clean_elb(elb: &Value) -> Option<ElbSummary> {
    let instances: Vec<String> = elb
        .get("instances")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|i| i.get("instanceId").and_then(Value::as_str))
        .map(str::to_owned)
        .collect();
    if instances.is_empty() {
        return None;
    }
    let ports = elb
        .get("listenerDescriptions")
        .and_then(Value::as_array)
        .map(|listeners| {
            listeners
                .iter()
                .map(|l| {
                    l.get("listener")
                        .and_then(|li| li.get("loadBalancerPort"))
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect()
        })
        .unwrap_or_default();
    Some(ElbSummary {
        dns_name: elb
            .get("DNSName")
            .and_then(Value::as_str)
            .map(str::to_owned),
        instances,
        ports,
    })
}

/// Flatten a group's `ipPermissions` into one `{port, range}` entry per
/// ipRange per permission.
fn flatten_permissions(group: &Value) -> Vec<Value> {
    let mut rules = Vec::new();
    for perm in group
        .get("ipPermissions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let port = perm.get("toPort").cloned().unwrap_or(Value::Null);
        for range in perm
            .get("ipRanges")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            rules.push(json!({"port": port, "range": range}));
        }
    }
    rules
}

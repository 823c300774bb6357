//! `iam` rule -- identity users created or granted new group memberships
//! inside the window.
//!
//! For every user touched in the window the rule fetches the revision
//! diff and scans it for `"groups" : [...]` blocks, collecting lines
//! added with `+`. A diff that fails upstream with "only one document"
//! means the user is brand new; the rule then reports the full user
//! record instead.

use std::collections::BTreeSet;

use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use driftwatch_core::Finding;
use driftwatch_core::error::{DriftwatchError, RuleError, SnapshotError};
use driftwatch_snapshot::SnapshotClient;

use crate::allowlist::AllowList;
use crate::{Rule, RuleContext, not_initialized};

const NAME: &str = "iam";

const GROUPS_BLOCK: &str = r#""groups" : \[([^\]]+)\]"#;

const SINGLE_DOCUMENT_MESSAGE: &str = "_diff requires at least 2 documents, only 1 found";

#[derive(Default)]
pub struct IamUserRule {
    client: Option<SnapshotClient>,
    allowed: AllowList,
    groups_block: Option<Regex>,
}

impl IamUserRule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Rule for IamUserRule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
        self.allowed = AllowList::from_config(&ctx.config, "allowed");
        self.groups_block = Some(Regex::new(GROUPS_BLOCK).map_err(|e| {
            RuleError::BadConfig {
                name: NAME.to_owned(),
                reason: e.to_string(),
            }
        })?);
        self.client = Some(ctx.client);
        Ok(())
    }

    async fn execute(&mut self) -> Result<Vec<Finding>, DriftwatchError> {
        let client = self.client.as_ref().ok_or_else(|| not_initialized(NAME))?;
        let groups_block = self
            .groups_block
            .as_ref()
            .ok_or_else(|| not_initialized(NAME))?;
        let users = client.updated_only().query("/api/v2/aws/iamUsers").await?;

        // A user may have several revisions in the window; inspect once.
        let users: BTreeSet<&str> = users
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .collect();

        let mut findings = Vec::new();
        for username in users {
            if self.allowed.matches(username) {
                continue;
            }
            let mut details = Vec::new();
            match client
                .raw_query(&format!("/api/v2/aws/iamUsers/{username};_diff=200"))
                .await
            {
                Ok(diff) => {
                    let added = added_groups(groups_block, &diff);
                    if !added.is_empty() {
                        details.push(json!(format!(
                            "Groups the user has been added to: {}",
                            added.join(", ")
                        )));
                    }
                }
                Err(SnapshotError::Upstream { payload, .. })
                    if payload.get("code").and_then(Value::as_i64) == Some(400)
                        && payload.get("message").and_then(Value::as_str)
                            == Some(SINGLE_DOCUMENT_MESSAGE) =>
                {
                    debug!(user = username, "single revision, treating as new user");
                    let user = client
                        .updated_only()
                        .query(&format!("/api/v2/aws/iamUsers/{username}"))
                        .await?;
                    details.push(json!(format!("New user has been added: {user}")));
                }
                Err(e) => return Err(e.into()),
            }
            if !details.is_empty() {
                findings.push(Finding::new(NAME, username.to_owned(), details));
            }
        }
        Ok(findings)
    }
}

/// Collect group names added (`+` lines) inside `"groups" : [...]` blocks
/// of a textual revision diff.
fn added_groups(groups_block: &Regex, diff: &str) -> Vec<String> {
    let mut added = Vec::new();
    for capture in groups_block.captures_iter(diff) {
        let Some(block) = capture.get(1) else {
            continue;
        };
        for line in block.as_str().trim().lines() {
            let Some(marker) = line.chars().next() else {
                continue;
            };
            let stripped = line
                .get(1..)
                .unwrap_or("")
                .trim_matches(|c: char| c == ' ' || c == '"' || c == ',');
            if !stripped.is_empty() && marker == '+' {
                added.push(stripped.to_owned());
            }
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DynRule;
    use crate::testutil::{MockTransport, context};
    use driftwatch_core::StateNamespace;
    use std::sync::Arc;

    const USERS_URL: &str = "http://svc/api/v2/aws/iamUsers;_updated";

    async fn run(transport: &Arc<MockTransport>, config: Value) -> Vec<Finding> {
        let mut rule = IamUserRule::new();
        Rule::init(&mut rule, context(transport, config, StateNamespace::default()))
            .unwrap();
        DynRule::execute(&mut rule).await.unwrap()
    }

    #[test]
    fn added_groups_reads_plus_lines_only() {
        let regex = Regex::new(GROUPS_BLOCK).unwrap();
        let diff = concat!(
            "  \"groups\" : [\n",
            "+   \"admins\",\n",
            "-   \"interns\",\n",
            "    \"developers\"\n",
            "]",
        );
        assert_eq!(added_groups(&regex, diff), vec!["admins".to_owned()]);
    }

    #[tokio::test]
    async fn group_addition_alerts() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(USERS_URL, r#"["alice", "alice"]"#);
        transport.respond(
            "http://svc/api/v2/aws/iamUsers/alice;_diff=200",
            "  \"groups\" : [\n+   \"admins\"\n]",
        );

        let findings = run(&transport, json!({})).await;

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].subject_id, "alice");
        assert_eq!(
            findings[0].details,
            vec![json!("Groups the user has been added to: admins")]
        );
        // Deduplicated: one diff fetch despite two revisions in the list.
        assert_eq!(
            transport.calls.load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }

    #[tokio::test]
    async fn removed_group_stays_quiet() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(USERS_URL, r#"["bob"]"#);
        transport.respond(
            "http://svc/api/v2/aws/iamUsers/bob;_diff=200",
            "  \"groups\" : [\n-   \"admins\"\n]",
        );
        assert!(run(&transport, json!({})).await.is_empty());
    }

    #[tokio::test]
    async fn single_revision_reports_new_user() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(USERS_URL, r#"["carol"]"#);
        transport.respond_status(
            "http://svc/api/v2/aws/iamUsers/carol;_diff=200",
            400,
            &json!({"code": 400, "message": SINGLE_DOCUMENT_MESSAGE}).to_string(),
        );
        transport.respond(
            "http://svc/api/v2/aws/iamUsers/carol;_updated",
            r#"{"userName": "carol", "arn": "arn:aws:iam::1:user/carol"}"#,
        );

        let findings = run(&transport, json!({})).await;

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].subject_id, "carol");
        let text = findings[0].details[0].as_str().unwrap();
        assert!(text.starts_with("New user has been added: "));
        assert!(text.contains("carol"));
    }

    #[tokio::test]
    async fn allow_listed_user_is_skipped() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(USERS_URL, r#"["deploy-bot"]"#);
        let findings = run(&transport, json!({"allowed": ["deploy-.*"]})).await;
        assert!(findings.is_empty());
        // No diff fetch for suppressed users.
        assert_eq!(
            transport.calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn other_upstream_errors_propagate() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(USERS_URL, r#"["dave"]"#);
        transport.respond_status(
            "http://svc/api/v2/aws/iamUsers/dave;_diff=200",
            500,
            r#"{"code": 500, "message": "boom"}"#,
        );
        let mut rule = IamUserRule::new();
        Rule::init(&mut rule, context(&transport, json!({}), StateNamespace::default()))
            .unwrap();
        assert!(DynRule::execute(&mut rule).await.is_err());
    }
}

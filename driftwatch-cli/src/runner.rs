//! The orchestrator -- runs each selected rule sequentially against the
//! shared window, with per-rule failure isolation.
//!
//! Every rule gets its `plugin.<name>` config and state namespace, the
//! pre-windowed client and the shared enricher. A failing rule has its
//! namespace mutations rolled back to the pre-rule snapshot and is
//! reported in the run summary; the remaining rules still run and the
//! surviving state is still saved.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{error, info, warn};

use driftwatch_alerting::Aggregator;
use driftwatch_core::config::Config;
use driftwatch_core::error::DriftwatchError;
use driftwatch_core::state::StateDocument;
use driftwatch_enrich::InstanceEnricher;
use driftwatch_rules::{DynRule, RuleContext};
use driftwatch_snapshot::SnapshotClient;

/// One rule that failed during this run.
pub struct RuleFailure {
    pub rule: &'static str,
    pub error: DriftwatchError,
}

/// Outcome of one orchestrated pass.
#[derive(Default)]
pub struct RunReport {
    pub executed: usize,
    pub findings: usize,
    pub failures: Vec<RuleFailure>,
}

impl RunReport {
    pub fn failed(&self) -> bool {
        !self.failures.is_empty()
    }

    /// One line per failed rule, for the end-of-run summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for failure in &self.failures {
            let _ = writeln!(out, "rule '{}' failed: {}", failure.rule, failure.error);
        }
        out
    }
}

/// Run `rules` (narrowed to `selected` when non-empty) sequentially.
pub async fn run_rules(
    rules: &mut [Box<dyn DynRule>],
    selected: &[String],
    client: &SnapshotClient,
    config: &Config,
    state: &mut StateDocument,
    enricher: Arc<InstanceEnricher>,
    aggregator: &mut Aggregator,
) -> RunReport {
    for name in selected {
        if !rules.iter().any(|rule| rule.name() == name) {
            warn!(rule = %name, "unknown rule name, skipping");
        }
    }

    let mut report = RunReport::default();
    for rule in rules {
        let name = rule.name();
        if !selected.is_empty() && !selected.iter().any(|s| s == name) {
            continue;
        }
        info!(rule = name, "running rule");
        let namespace = state.namespace(&format!("plugin.{name}"));
        let rollback = namespace.snapshot();
        let ctx = RuleContext {
            client: client.clone(),
            config: config.rule_config(name),
            state: namespace.clone(),
            enricher: Arc::clone(&enricher),
        };

        let outcome = match rule.init(ctx) {
            Ok(()) => rule.execute().await,
            Err(e) => Err(e),
        };
        report.executed += 1;
        match outcome {
            Ok(findings) => {
                info!(rule = name, findings = findings.len(), "rule finished");
                report.findings += findings.len();
                aggregator.record(&findings);
            }
            Err(e) => {
                error!(rule = name, error = %e, "rule failed, rolling back its state");
                namespace.restore(rollback);
                report.failures.push(RuleFailure {
                    rule: name,
                    error: e,
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftwatch_core::error::RuleError;
    use driftwatch_core::{BoxFuture, Finding};
    use serde_json::json;

    struct FlakyRule {
        name: &'static str,
        fail: bool,
    }

    impl DynRule for FlakyRule {
        fn name(&self) -> &'static str {
            self.name
        }

        fn init(&mut self, ctx: RuleContext) -> Result<(), DriftwatchError> {
            ctx.state.ensure("marker", json!([]));
            Ok(())
        }

        fn execute(&mut self) -> BoxFuture<'_, Result<Vec<Finding>, DriftwatchError>> {
            let fail = self.fail;
            let name = self.name;
            Box::pin(async move {
                if fail {
                    Err(RuleError::Execution {
                        name: name.to_owned(),
                        reason: "wired to fail".to_owned(),
                    }
                    .into())
                } else {
                    Ok(vec![Finding::new(name, "subject", vec![json!("d")])])
                }
            })
        }
    }

    async fn run(
        rules: &mut [Box<dyn DynRule>],
        selected: &[String],
        state: &mut StateDocument,
        aggregator: &mut Aggregator,
    ) -> RunReport {
        let client = SnapshotClient::new("http://svc");
        run_rules(
            rules,
            selected,
            &client,
            &Config::default(),
            state,
            Arc::new(InstanceEnricher::from_records(&[], &[])),
            aggregator,
        )
        .await
    }

    #[tokio::test]
    async fn failing_rule_does_not_stop_the_batch() {
        let mut rules: Vec<Box<dyn DynRule>> = vec![
            Box::new(FlakyRule {
                name: "broken",
                fail: true,
            }),
            Box::new(FlakyRule {
                name: "fine",
                fail: false,
            }),
        ];
        let mut state = StateDocument::default();
        let mut aggregator = Aggregator::new();

        let report = run(&mut rules, &[], &mut state, &mut aggregator).await;

        assert_eq!(report.executed, 2);
        assert_eq!(report.findings, 1);
        assert!(report.failed());
        assert_eq!(report.failures[0].rule, "broken");
        assert!(report.summary().contains("wired to fail"));
        assert_eq!(aggregator.len(), 1);
    }

    #[tokio::test]
    async fn failing_rule_state_is_rolled_back() {
        let mut rules: Vec<Box<dyn DynRule>> = vec![Box::new(FlakyRule {
            name: "broken",
            fail: true,
        })];
        let mut state = StateDocument::default();
        let ns = state.namespace("plugin.broken");
        let mut aggregator = Aggregator::new();

        run(&mut rules, &[], &mut state, &mut aggregator).await;

        // init's ensure() was discarded with the rollback.
        assert!(ns.get("marker").is_none());
    }

    #[tokio::test]
    async fn selection_narrows_the_batch() {
        let mut rules: Vec<Box<dyn DynRule>> = vec![
            Box::new(FlakyRule {
                name: "a",
                fail: false,
            }),
            Box::new(FlakyRule {
                name: "b",
                fail: false,
            }),
        ];
        let mut state = StateDocument::default();
        let mut aggregator = Aggregator::new();

        let report = run(
            &mut rules,
            &["b".to_owned(), "nonexistent".to_owned()],
            &mut state,
            &mut aggregator,
        )
        .await;

        assert_eq!(report.executed, 1);
        assert_eq!(aggregator.tuples()[0].rule_name, "b");
    }
}

//! End-to-end runner cycle over a canned snapshot service: first run
//! alerts, state is saved and reloaded, and the follow-up run with the
//! advanced window stays quiet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;

use driftwatch_alerting::Aggregator;
use driftwatch_cli::runner::run_rules;
use driftwatch_core::BoxFuture;
use driftwatch_core::config::Config;
use driftwatch_core::error::SnapshotError;
use driftwatch_core::state::StateDocument;
use driftwatch_enrich::InstanceEnricher;
use driftwatch_rules::builtin_rules;
use driftwatch_snapshot::{SnapshotClient, Transport};

struct CannedTransport {
    responses: Mutex<HashMap<String, String>>,
}

impl CannedTransport {
    fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
        }
    }

    fn respond(&self, url: &str, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_owned(), body.to_owned());
    }
}

impl Transport for CannedTransport {
    fn get(&self, url: &str) -> BoxFuture<'_, Result<(u16, String), SnapshotError>> {
        let canned = self.responses.lock().unwrap().get(url).cloned();
        let url = url.to_owned();
        Box::pin(async move {
            canned.map(|body| (200, body)).ok_or(SnapshotError::Transport {
                url,
                reason: "no canned response".to_owned(),
            })
        })
    }
}

fn transport() -> Arc<CannedTransport> {
    let transport = Arc::new(CannedTransport::new());
    // clean() drops the window, so the inventory URL carries no modifiers.
    transport.respond(
        "http://svc/api/v2/view/instances;_expand",
        &json!([{
            "instanceId": "i-1",
            "imageId": "ami-new",
            "launchTime": 1000,
            "tags": []
        }])
        .to_string(),
    );
    transport
}

async fn run_ami(state: &mut StateDocument, since: i64, until: i64) -> (usize, Aggregator) {
    let client = SnapshotClient::with_transport(
        "http://svc",
        transport() as Arc<dyn Transport>,
    )
    .since(since)
    .until(until);
    let mut rules = builtin_rules();
    let mut aggregator = Aggregator::new();
    let report = run_rules(
        &mut rules,
        &["ami".to_owned()],
        &client,
        &Config::default(),
        state,
        Arc::new(InstanceEnricher::from_records(&[], &[])),
        &mut aggregator,
    )
    .await;
    assert!(!report.failed(), "{}", report.summary());
    (report.findings, aggregator)
}

#[tokio::test]
async fn advancing_the_window_silences_reported_drift() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    // First run: the image is new inside [0, 2000) and alerts.
    let mut state = StateDocument::default();
    let (findings, aggregator) = run_ami(&mut state, 0, 2000).await;
    assert_eq!(findings, 1);
    assert_eq!(aggregator.tuples()[0].rule_name, "ami");
    assert_eq!(aggregator.tuples()[0].subject_id, "ami-new");

    // The runner stores this run's `until` as the next `since`.
    state.set_global("since", json!(2000));
    state.save(&state_path).unwrap();

    // Second run against the reloaded state: the image's first-seen
    // timestamp now predates the window, so nothing alerts.
    let mut reloaded = StateDocument::load(&state_path);
    assert_eq!(reloaded.global("since"), Some(&json!(2000)));
    let (findings, aggregator) = run_ami(&mut reloaded, 2000, 4000).await;
    assert_eq!(findings, 0);
    assert!(aggregator.is_empty());

    // The first-seen anchor survived both runs.
    let ns = reloaded.namespace("plugin.ami");
    assert_eq!(ns.get_i64_map("first_seen").get("ami-new"), Some(&1000));
}

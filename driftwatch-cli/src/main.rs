use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use driftwatch_alerting::{Aggregator, build_sinks};
use driftwatch_core::config::{Config, DEFAULT_SNAPSHOT_URL};
use driftwatch_core::state::StateDocument;
use driftwatch_enrich::InstanceEnricher;
use driftwatch_rules::builtin_rules;
use driftwatch_snapshot::SnapshotClient;

use driftwatch_cli::cli::Cli;
use driftwatch_cli::lock::RunLock;
use driftwatch_cli::logging::init_tracing;
use driftwatch_cli::runner::run_rules;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.silent, &cli.log_format) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    match run(cli).await {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "driftwatch aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    // Exclusive per-state-file lock, taken before anything is read.
    let _lock = RunLock::acquire(&cli.state_file)?;

    let config = Config::load(&cli.config_file).context("failed to load configuration")?;
    let mut state = StateDocument::load(&cli.state_file);

    let since = cli
        .since_ms()
        .or_else(|| state.global("since").and_then(Value::as_i64))
        .unwrap_or(0);
    let until = cli.until_ms();
    let snapshot_url = config
        .resolve(
            "snapshot_url",
            cli.snapshot_url.as_deref(),
            DEFAULT_SNAPSHOT_URL,
        )
        .to_owned();
    info!(since, until, url = %snapshot_url, "starting run");

    let client = SnapshotClient::new(&snapshot_url).since(since).until(until);
    let enricher = match InstanceEnricher::build(&client).await {
        Ok(enricher) => Arc::new(enricher),
        Err(e) => {
            warn!(error = %e, "enrichment caches unavailable, running without them");
            Arc::new(InstanceEnricher::from_records(&[], &[]))
        }
    };

    let sinks = build_sinks(&config.outputs(cli.output.as_deref()), &config)?;

    let mut rules = builtin_rules();
    let mut aggregator = Aggregator::new();
    let report = run_rules(
        &mut rules,
        &cli.rules,
        &client,
        &config,
        &mut state,
        enricher,
        &mut aggregator,
    )
    .await;

    info!(
        executed = report.executed,
        findings = report.findings,
        "dispatching alerts"
    );
    aggregator.dispatch(&sinks).await;

    if cli.store_until {
        state.set_global("since", json!(until));
    }
    state
        .save(&cli.state_file)
        .context("failed to save state file")?;

    if report.failed() {
        error!("{}", report.summary().trim_end());
        return Ok(false);
    }
    info!("driftwatch finished successfully");
    Ok(true)
}

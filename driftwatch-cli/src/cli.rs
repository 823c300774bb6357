//! CLI argument definitions for the driftwatch runner.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use chrono::{NaiveDateTime, Utc};
use clap::Parser;

/// The `--until` safety margin: the last five minutes are excluded so an
/// eventually-consistent upstream has time to settle.
const UNTIL_MARGIN_MS: i64 = 5 * 60 * 1000;

/// Runs drift rules against a cloud inventory snapshot.
#[derive(Parser, Debug)]
#[command(name = "driftwatch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Rules to run (default: all built-in rules).
    #[arg(value_name = "rule")]
    pub rules: Vec<String>,

    /// Configuration file.
    #[arg(short = 'c', long, default_value = "etc/config.json")]
    pub config_file: PathBuf,

    /// Persistent state between runs.
    #[arg(short = 'f', long, default_value = "etc/state.json")]
    pub state_file: PathBuf,

    /// Window start override: epoch milliseconds or "%Y-%m-%d %H:%M:%S".
    ///
    /// Takes precedence over the `since` stored in the state file.
    #[arg(short = 's', long)]
    pub since: Option<String>,

    /// Window end, epoch milliseconds (default: now minus five minutes).
    #[arg(short = 'u', long)]
    pub until: Option<i64>,

    /// Store this run's `until` as the next run's `since`.
    #[arg(long)]
    pub store_until: bool,

    /// Snapshot service base URL (overrides the config file).
    #[arg(short = 'e', long)]
    pub snapshot_url: Option<String>,

    /// Comma-separated sink list
    /// (stdout,stdout_tabsep,mail_txt,mail_html,index).
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Suppress log messages below warning.
    #[arg(short = 'l', long)]
    pub silent: bool,

    /// Log format (json, pretty).
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Cli {
    /// The resolved window start override, if `--since` was given and
    /// parseable.
    pub fn since_ms(&self) -> Option<i64> {
        self.since.as_deref().and_then(parse_since)
    }

    /// The resolved window end.
    pub fn until_ms(&self) -> i64 {
        self.until.unwrap_or_else(default_until)
    }
}

/// Parse a `--since` value: a wall-clock timestamp first, then epoch
/// milliseconds.
pub fn parse_since(raw: &str) -> Option<i64> {
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.and_utc().timestamp_millis());
    }
    raw.parse::<i64>().ok()
}

pub fn default_until() -> i64 {
    Utc::now().timestamp_millis() - UNTIL_MARGIN_MS
}

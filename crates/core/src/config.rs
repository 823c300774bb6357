//! Configuration document -- a flat JSON mapping shared by the runner,
//! the rules and the alert sinks.
//!
//! Global keys (`snapshot_url`, `output`, mail and index settings) live at
//! the top level; per-rule options live under `plugin.<rule-name>` objects.
//! A missing or unreadable file degrades to an empty document with a
//! warning, so a bare invocation still runs with defaults.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ConfigError;

/// Default snapshot service base URL.
pub const DEFAULT_SNAPSHOT_URL: &str = "http://localhost:8080/snapshot";

/// Default enabled sink list.
pub const DEFAULT_OUTPUT: &str = "stdout";

/// The loaded configuration document.
#[derive(Debug, Clone, Default)]
pub struct Config {
    root: Map<String, Value>,
}

impl Config {
    /// Build a configuration from an already-parsed JSON object.
    pub fn from_map(root: Map<String, Value>) -> Self {
        Self { root }
    }

    /// Load a configuration file.
    ///
    /// A missing file is tolerated (empty document); invalid JSON or a
    /// non-object top level is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config file unreadable, using defaults");
                return Ok(Self::default());
            }
        };
        Self::parse(&raw).map_err(|reason| ConfigError::ParseFailed {
            path: path.display().to_string(),
            reason,
        })
    }

    /// Parse a configuration document from a JSON string.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        match value {
            Value::Object(root) => Ok(Self { root }),
            other => Err(format!("expected a JSON object, got {other}")),
        }
    }

    /// Look up a global key.
    pub fn global(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Look up a global string key.
    pub fn global_str(&self, key: &str) -> Option<&str> {
        self.root.get(key).and_then(Value::as_str)
    }

    /// Resolve a value with CLI-override precedence: explicit argument,
    /// then config document, then default.
    pub fn resolve<'a>(&'a self, key: &str, arg: Option<&'a str>, default: &'a str) -> &'a str {
        arg.or_else(|| self.global_str(key)).unwrap_or(default)
    }

    /// The per-rule options object for `plugin.<name>`, or an empty map.
    pub fn rule_config(&self, rule_name: &str) -> Map<String, Value> {
        match self.root.get(&format!("plugin.{rule_name}")) {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                warn!(rule = rule_name, value = %other, "per-rule config is not an object, ignoring");
                Map::new()
            }
            None => Map::new(),
        }
    }

    /// Enabled sink names, from an override or the `output` global key.
    pub fn outputs(&self, arg: Option<&str>) -> Vec<String> {
        self.resolve("output", arg, DEFAULT_OUTPUT)
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Mail sink settings, resolved from global keys with the original
/// defaults.
#[derive(Debug, Clone)]
pub struct MailSettings {
    pub smtp_host: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
}

impl MailSettings {
    pub fn from_config(config: &Config) -> Self {
        let to = match config.global("email_to") {
            Some(Value::Array(addrs)) => addrs
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            Some(Value::String(addr)) => vec![addr.clone()],
            _ => vec!["root@localhost".to_owned()],
        };
        Self {
            smtp_host: config
                .resolve("smtp_host", None, "localhost")
                .to_owned(),
            from: config
                .resolve("email_from", None, "driftwatch@localhost")
                .to_owned(),
            to,
            subject: config
                .resolve("email_subject", None, "[driftwatch] Report")
                .to_owned(),
        }
    }
}

/// Indexed-document sink settings.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    /// Base URL of the document index, e.g. `http://localhost:9200`.
    pub base_url: String,
    /// Index name documents are written into.
    pub index: String,
}

impl IndexSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config
                .resolve("index_url", None, "http://localhost:9200")
                .trim_end_matches('/')
                .to_owned(),
            index: config.resolve("index_name", None, "driftwatch").to_owned(),
        }
    }
}

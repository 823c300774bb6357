//! Allow-list suppression.
//!
//! Subjects matching an allow-list entry are suppressed before a finding
//! is emitted and never enter the dedup state. Entries match exactly, or
//! as regexes anchored at the start of the subject (entries that fail to
//! compile fall back to exact matching only).

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::warn;

use crate::config_str_list;

#[derive(Debug, Default)]
pub struct AllowList {
    exact: HashSet<String>,
    patterns: Vec<Regex>,
}

impl AllowList {
    /// Build from a list of entries.
    pub fn from_entries(entries: &[String]) -> Self {
        let mut exact = HashSet::new();
        let mut patterns = Vec::new();
        for entry in entries {
            exact.insert(entry.clone());
            match Regex::new(&format!("^(?:{entry})")) {
                Ok(regex) => patterns.push(regex),
                Err(e) => {
                    warn!(entry = %entry, error = %e, "allow-list entry is not a valid regex, exact match only");
                }
            }
        }
        Self { exact, patterns }
    }

    /// Build from a per-rule config key holding a list of strings.
    pub fn from_config(config: &Map<String, Value>, key: &str) -> Self {
        Self::from_entries(&config_str_list(config, key))
    }

    /// Whether `subject` is suppressed by any entry.
    pub fn matches(&self, subject: &str) -> bool {
        self.exact.contains(subject) || self.patterns.iter().any(|p| p.is_match(subject))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }
}

//! Finding and alert-tuple types.
//!
//! A [`Finding`] is one reportable unit produced by a rule: a subject plus
//! a list of detail payloads. The aggregator flattens findings into
//! [`AlertTuple`]s -- one tuple per detail element -- before fan-out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One reportable unit of rule output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Name of the rule that produced the finding.
    pub rule_name: String,
    /// Identity of the subject (instance id, group id, DNS name, ...).
    pub subject_id: String,
    /// Opaque detail payloads; each becomes its own alert tuple.
    pub details: Vec<Value>,
}

impl Finding {
    pub fn new(rule_name: impl Into<String>, subject_id: impl Into<String>, details: Vec<Value>) -> Self {
        Self {
            rule_name: rule_name.into(),
            subject_id: subject_id.into(),
            details,
        }
    }
}

/// One flattened `(rule, subject, detail)` alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTuple {
    pub rule_name: String,
    pub subject_id: String,
    pub detail: Value,
}

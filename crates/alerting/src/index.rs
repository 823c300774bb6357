//! Indexed-document sink -- one JSON document per tuple.
//!
//! Documents are written with `_create` and a content-derived id, so a
//! tuple indexed twice collapses into one document (the second write
//! answers 409 and is skipped). Per-document failures are logged and
//! never abort the batch.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use driftwatch_core::AlertTuple;
use driftwatch_core::config::IndexSettings;
use driftwatch_core::error::AlertError;

use crate::Sink;

/// Fixed `type` field stamped on every document.
const DOC_TYPE: &str = "driftwatch";

pub struct IndexSink {
    settings: IndexSettings,
    http: reqwest::Client,
}

impl IndexSink {
    pub fn new(settings: IndexSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }
}

/// Build the document for one tuple. Object details are merged into the
/// document top level; anything else lands under `details`.
pub fn index_document(tuple: &AlertTuple, timestamp: &str) -> Value {
    let mut doc = Map::new();
    doc.insert("rule".to_owned(), json!(tuple.rule_name));
    doc.insert("id".to_owned(), json!(tuple.subject_id));
    match &tuple.detail {
        Value::Object(fields) => {
            for (key, value) in fields {
                doc.insert(key.clone(), value.clone());
            }
        }
        other => {
            doc.insert("details".to_owned(), other.clone());
        }
    }
    doc.insert("@timestamp".to_owned(), json!(timestamp));
    doc.insert("type".to_owned(), json!(DOC_TYPE));
    Value::Object(doc)
}

/// Content-derived document id: hex SHA-256 of the serialized document
/// minus its ingestion timestamp, so re-runs produce the same id.
pub fn document_id(doc: &Value) -> String {
    let mut canonical = doc.clone();
    if let Some(fields) = canonical.as_object_mut() {
        fields.remove("@timestamp");
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

impl Sink for IndexSink {
    fn name(&self) -> &'static str {
        "index"
    }

    async fn deliver(&self, tuples: &[AlertTuple]) -> Result<(), AlertError> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        for tuple in tuples {
            let doc = index_document(tuple, &timestamp);
            let id = document_id(&doc);
            let url = format!(
                "{}/{}/_create/{}",
                self.settings.base_url, self.settings.index, id
            );
            match self.http.put(&url).json(&doc).send().await {
                Ok(response) if response.status().as_u16() == 409 => {
                    debug!(id = %id, "document already indexed, skipping");
                }
                Ok(response) if !response.status().is_success() => {
                    error!(id = %id, status = %response.status(), "index write rejected");
                }
                Ok(_) => {}
                Err(e) => error!(id = %id, error = %e, "index write failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(detail: Value) -> AlertTuple {
        AlertTuple {
            rule_name: "s3acl".to_owned(),
            subject_id: "logs:a.txt".to_owned(),
            detail,
        }
    }

    #[test]
    fn object_details_merge_into_the_document() {
        let doc = index_document(
            &tuple(json!({"port_open": false, "fromPort": 9000})),
            "2026-08-27T00:00:00.000Z",
        );
        assert_eq!(doc["rule"], "s3acl");
        assert_eq!(doc["id"], "logs:a.txt");
        assert_eq!(doc["fromPort"], 9000);
        assert_eq!(doc["type"], "driftwatch");
        assert_eq!(doc["@timestamp"], "2026-08-27T00:00:00.000Z");
        assert!(doc.get("details").is_none());
    }

    #[test]
    fn scalar_details_land_under_details() {
        let doc = index_document(&tuple(json!("Everyone READ")), "2026-08-27T00:00:00.000Z");
        assert_eq!(doc["details"], "Everyone READ");
    }

    #[test]
    fn document_id_ignores_the_timestamp() {
        let a = index_document(&tuple(json!("x")), "2026-08-27T00:00:00.000Z");
        let b = index_document(&tuple(json!("x")), "2026-08-28T12:34:56.000Z");
        assert_eq!(document_id(&a), document_id(&b));

        let c = index_document(&tuple(json!("y")), "2026-08-27T00:00:00.000Z");
        assert_ne!(document_id(&a), document_id(&c));
    }

    #[test]
    fn document_id_is_hex_sha256() {
        let doc = index_document(&tuple(json!("x")), "t");
        let id = document_id(&doc);
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

//! Error types -- per-domain error definitions.

/// driftwatch top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum DriftwatchError {
    /// Configuration errors.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Snapshot service errors.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Persisted state errors.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Rule execution errors.
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    /// Alert delivery errors.
    #[error("alert error: {0}")]
    Alert(#[from] AlertError),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration parsing failed.
    #[error("failed to parse config '{path}': {reason}")]
    ParseFailed { path: String, reason: String },

    /// A configuration value has the wrong shape or an invalid value.
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Snapshot query client errors.
///
/// The three variants are deliberately distinct: a transport failure, an
/// application-level error payload carried in an otherwise-successful
/// response, and an unparseable body must be distinguishable by callers
/// (the `iam` rule branches on `Upstream`).
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Connectivity or HTTP-level failure.
    #[error("transport error for '{url}': {reason}")]
    Transport { url: String, reason: String },

    /// The snapshot service answered with an error payload (a `code`
    /// field in the response body), possibly on HTTP 200.
    #[error("snapshot service returned an error for '{url}': {payload}")]
    Upstream {
        url: String,
        payload: serde_json::Value,
    },

    /// The response body could not be parsed as JSON.
    #[error("failed to parse response from '{url}': {reason}")]
    Parse { url: String, reason: String },
}

/// Persisted state errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Writing the state document back to disk failed.
    #[error("failed to write state file '{path}': {reason}")]
    WriteFailed { path: String, reason: String },

    /// The in-memory state document could not be serialized.
    #[error("failed to serialize state: {0}")]
    Serialize(String),
}

/// Rule contract errors.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// `execute` was called before `init`.
    #[error("rule '{name}' executed before init")]
    NotInitialized { name: String },

    /// A required per-rule configuration key is missing or malformed.
    #[error("rule '{name}' misconfigured: {reason}")]
    BadConfig { name: String, reason: String },

    /// The rule's own execution failed.
    #[error("rule '{name}' failed: {reason}")]
    Execution { name: String, reason: String },

    /// An external collaborator (object store, prober) failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

/// Alert sink errors.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// A sink is referenced in configuration but does not exist.
    #[error("unknown alert sink: {name}")]
    UnknownSink { name: String },

    /// Delivery through a sink failed.
    #[error("sink '{sink}' delivery failed: {reason}")]
    Delivery { sink: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_error_variants_are_distinguishable() {
        let upstream = SnapshotError::Upstream {
            url: "http://x/a".to_owned(),
            payload: serde_json::json!({"code": 400, "message": "boom"}),
        };
        assert!(matches!(upstream, SnapshotError::Upstream { .. }));
        assert!(upstream.to_string().contains("http://x/a"));

        let parse = SnapshotError::Parse {
            url: "http://x/a".to_owned(),
            reason: "eof".to_owned(),
        };
        assert!(!matches!(parse, SnapshotError::Upstream { .. }));
    }

    #[test]
    fn rule_error_converts_to_driftwatch_error() {
        let err: DriftwatchError = RuleError::NotInitialized {
            name: "ami".to_owned(),
        }
        .into();
        assert!(matches!(err, DriftwatchError::Rule(_)));
        assert!(err.to_string().contains("ami"));
    }

    #[test]
    fn config_error_display_carries_field() {
        let err = ConfigError::InvalidValue {
            field: "output".to_owned(),
            reason: "expected string".to_owned(),
        };
        assert!(err.to_string().contains("output"));
        assert!(err.to_string().contains("expected string"));
    }
}

//! Persisted cross-run state -- the single JSON document that gives the
//! batch run its memory.
//!
//! The document is loaded once at process start, mutated in place by rules
//! through per-rule [`StateNamespace`] handles, and serialized wholesale
//! once at process end. There is no per-rule flush and no transactional
//! isolation; the runner is responsible for discarding a failing rule's
//! namespace mutations before saving.
//!
//! An absent or unparseable file is treated as an empty document, never as
//! a fatal error.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::StateError;

/// The whole persisted document.
#[derive(Debug, Default)]
pub struct StateDocument {
    /// Top-level keys that are not rule namespaces (e.g. the global
    /// `since` written by `--store-until`).
    root: Map<String, Value>,
    /// Live namespace handles, keyed by full name (`plugin.<rule>`).
    handles: BTreeMap<String, StateNamespace>,
}

impl StateDocument {
    /// Load the document from disk.
    ///
    /// Missing files and invalid JSON both yield an empty document.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state file unreadable, starting empty");
                return Self::default();
            }
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(root)) => Self {
                root,
                handles: BTreeMap::new(),
            },
            Ok(other) => {
                warn!(path = %path.display(), value = %other, "state file is not an object, starting empty");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state file is invalid JSON, starting empty");
                Self::default()
            }
        }
    }

    /// Get (creating on first use) the namespace handle for a full name
    /// such as `plugin.ami`.
    ///
    /// The handle is shared: mutations made through any clone are visible
    /// when the document is serialized.
    pub fn namespace(&mut self, full_name: &str) -> StateNamespace {
        if let Some(handle) = self.handles.get(full_name) {
            return handle.clone();
        }
        let initial = match self.root.remove(full_name) {
            Some(Value::Object(map)) => map,
            Some(other) => {
                warn!(namespace = full_name, value = %other, "namespace is not an object, resetting");
                Map::new()
            }
            None => Map::new(),
        };
        let handle = StateNamespace::new(initial);
        self.handles.insert(full_name.to_owned(), handle.clone());
        handle
    }

    /// Read a non-namespace top-level key.
    pub fn global(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Write a non-namespace top-level key.
    pub fn set_global(&mut self, key: &str, value: Value) {
        self.root.insert(key.to_owned(), value);
    }

    /// Materialize the full document (root keys plus all namespaces).
    pub fn to_value(&self) -> Value {
        let mut out = self.root.clone();
        for (name, handle) in &self.handles {
            out.insert(name.clone(), Value::Object(handle.snapshot()));
        }
        Value::Object(out)
    }

    /// Serialize the document and overwrite the state file.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let serialized = serde_json::to_string_pretty(&self.to_value())
            .map_err(|e| StateError::Serialize(e.to_string()))?;
        std::fs::write(path, serialized).map_err(|e| StateError::WriteFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// A shared handle onto one rule's slice of the persisted document.
///
/// Cheap to clone; all clones see the same underlying map. The single
/// mutex exists only to make the handle `Send + Sync` -- rules execute
/// strictly sequentially, so there is never lock contention.
#[derive(Debug, Clone, Default)]
pub struct StateNamespace {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl StateNamespace {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        // Sequential execution; a poisoned lock only means a rule panicked
        // mid-write, and the runner discards that namespace anyway.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Read a key (cloned).
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Write a key.
    pub fn set(&self, key: &str, value: Value) {
        self.lock().insert(key.to_owned(), value);
    }

    /// Insert a default for `key` if it is missing, never overwriting.
    /// This is what makes rule `init` idempotent.
    pub fn ensure(&self, key: &str, default: Value) {
        self.lock().entry(key.to_owned()).or_insert(default);
    }

    /// Clone the namespace contents (for pre-rule rollback snapshots and
    /// final serialization).
    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    /// Replace the namespace contents (rollback after a rule failure).
    pub fn restore(&self, contents: Map<String, Value>) {
        *self.lock() = contents;
    }

    // -- typed helpers used by the dedup algorithms --

    /// Read `key` as a `name -> integer timestamp` map; entries of the
    /// wrong shape are skipped.
    pub fn get_i64_map(&self, key: &str) -> HashMap<String, i64> {
        match self.lock().get(key) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_i64().map(|ts| (k.clone(), ts)))
                .collect(),
            _ => HashMap::new(),
        }
    }

    /// Persist a `name -> integer timestamp` map under `key`.
    pub fn set_i64_map(&self, key: &str, map: &HashMap<String, i64>) {
        let ordered: BTreeMap<_, _> = map.iter().collect();
        let obj: Map<String, Value> = ordered
            .into_iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        self.set(key, Value::Object(obj));
    }

    /// Read `key` as a `subject -> value` string map.
    pub fn get_str_map(&self, key: &str) -> BTreeMap<String, String> {
        match self.lock().get(key) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Persist a `subject -> value` string map under `key`.
    pub fn set_str_map(&self, key: &str, map: &BTreeMap<String, String>) {
        let obj: Map<String, Value> = map
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();
        self.set(key, Value::Object(obj));
    }

    /// Read `key` as a list of strings.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.lock().get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Persist a list of strings under `key`.
    pub fn set_str_list(&self, key: &str, list: &[String]) {
        self.set(
            key,
            Value::Array(list.iter().cloned().map(Value::from).collect()),
        );
    }
}

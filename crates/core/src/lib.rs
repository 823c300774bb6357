//! driftwatch-core -- shared types for the driftwatch batch drift monitor.
//!
//! # Module Structure
//!
//! - [`error`]: per-domain error enums under the [`error::DriftwatchError`] umbrella
//! - [`config`]: the flat JSON configuration document (`plugin.<name>` resolution)
//! - [`state`]: the persisted cross-run JSON state document and namespace handles
//! - [`finding`]: `Finding` / `AlertTuple` output types

pub mod config;
pub mod error;
pub mod finding;
pub mod state;

// --- Public API re-exports ---

pub use config::{Config, IndexSettings, MailSettings};
pub use error::{AlertError, ConfigError, DriftwatchError, RuleError, SnapshotError, StateError};
pub use finding::{AlertTuple, Finding};
pub use state::{StateDocument, StateNamespace};

use std::future::Future;
use std::pin::Pin;

/// Boxed future alias used by the dyn-compatible trait mirrors
/// (`DynRule`, `DynSink`, `Transport`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

//! driftwatch-alerting -- alert aggregation and delivery sinks.
//!
//! The [`Aggregator`] collects `(rule, subject, detail)` tuples across the
//! whole run and dispatches them once, after every rule has executed. A
//! sink failure is logged and skipped; one broken transport never blocks
//! the others.
//!
//! Available sinks: `stdout`, `stdout_tabsep` (console), `mail_txt`,
//! `mail_html` (SMTP) and `index` (indexed JSON documents).

use std::future::Future;

use tracing::{debug, error};

use driftwatch_core::config::{Config, IndexSettings, MailSettings};
use driftwatch_core::error::AlertError;
use driftwatch_core::{AlertTuple, BoxFuture, Finding};

pub mod console;
pub mod email;
pub mod index;

pub use console::ConsoleSink;
pub use email::MailSink;
pub use index::IndexSink;

/// One delivery target for recorded alerts.
pub trait Sink: Send + Sync {
    /// The name the sink is enabled by in the `output` list.
    fn name(&self) -> &'static str;

    /// Deliver the full tuple list.
    fn deliver(
        &self,
        tuples: &[AlertTuple],
    ) -> impl Future<Output = Result<(), AlertError>> + Send;
}

/// dyn-compatible mirror of [`Sink`], same pattern as the rule registry.
pub trait DynSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn deliver<'a>(&'a self, tuples: &'a [AlertTuple]) -> BoxFuture<'a, Result<(), AlertError>>;
}

impl std::fmt::Debug for dyn DynSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DynSink").field(&self.name()).finish()
    }
}

impl<T: Sink> DynSink for T {
    fn name(&self) -> &'static str {
        Sink::name(self)
    }

    fn deliver<'a>(&'a self, tuples: &'a [AlertTuple]) -> BoxFuture<'a, Result<(), AlertError>> {
        Box::pin(Sink::deliver(self, tuples))
    }
}

/// Collects flattened alert tuples for end-of-run dispatch.
#[derive(Debug, Default)]
pub struct Aggregator {
    tuples: Vec<AlertTuple>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten findings into one tuple per detail element.
    pub fn record(&mut self, findings: &[Finding]) {
        for finding in findings {
            for detail in &finding.details {
                self.tuples.push(AlertTuple {
                    rule_name: finding.rule_name.clone(),
                    subject_id: finding.subject_id.clone(),
                    detail: detail.clone(),
                });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn tuples(&self) -> &[AlertTuple] {
        &self.tuples
    }

    /// Deliver everything recorded to every sink. A no-op when nothing
    /// was recorded. Returns how many sinks delivered successfully.
    pub async fn dispatch(&self, sinks: &[Box<dyn DynSink>]) -> usize {
        if self.tuples.is_empty() {
            debug!("no alerts recorded, skipping dispatch");
            return 0;
        }
        let mut delivered = 0;
        for sink in sinks {
            match sink.deliver(&self.tuples).await {
                Ok(()) => delivered += 1,
                Err(e) => error!(sink = sink.name(), error = %e, "alert delivery failed"),
            }
        }
        delivered
    }
}

/// Instantiate the sinks named in the enabled-output list.
pub fn build_sinks(
    outputs: &[String],
    config: &Config,
) -> Result<Vec<Box<dyn DynSink>>, AlertError> {
    let mut sinks: Vec<Box<dyn DynSink>> = Vec::with_capacity(outputs.len());
    for output in outputs {
        match output.as_str() {
            "stdout" => sinks.push(Box::new(ConsoleSink::block())),
            "stdout_tabsep" => sinks.push(Box::new(ConsoleSink::tab_separated())),
            "mail_txt" => sinks.push(Box::new(MailSink::plain(MailSettings::from_config(config)))),
            "mail_html" => sinks.push(Box::new(MailSink::html(MailSettings::from_config(config)))),
            "index" => sinks.push(Box::new(IndexSink::new(IndexSettings::from_config(config)))),
            unknown => {
                return Err(AlertError::UnknownSink {
                    name: unknown.to_owned(),
                });
            }
        }
    }
    Ok(sinks)
}

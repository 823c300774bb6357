//! Console sink -- human-readable blocks or one tab-separated line per
//! tuple.

use driftwatch_core::AlertTuple;
use driftwatch_core::error::AlertError;

use crate::Sink;

pub struct ConsoleSink {
    tab_separated: bool,
}

impl ConsoleSink {
    /// Multi-line `Rule / Subject / Alert` blocks.
    pub fn block() -> Self {
        Self {
            tab_separated: false,
        }
    }

    /// One line per tuple, for piping into other tools.
    pub fn tab_separated() -> Self {
        Self {
            tab_separated: true,
        }
    }
}

/// Render one tuple in the sink's format.
pub fn format_alert(tuple: &AlertTuple, tab_separated: bool) -> String {
    if tab_separated {
        format!(
            "{}\t{}\t{}",
            tuple.rule_name, tuple.subject_id, tuple.detail
        )
    } else {
        format!(
            "Rule: {}\nSubject: {}\nAlert: {}\n",
            tuple.rule_name, tuple.subject_id, tuple.detail
        )
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &'static str {
        if self.tab_separated {
            "stdout_tabsep"
        } else {
            "stdout"
        }
    }

    async fn deliver(&self, tuples: &[AlertTuple]) -> Result<(), AlertError> {
        for tuple in tuples {
            println!("{}", format_alert(tuple, self.tab_separated));
        }
        Ok(())
    }
}

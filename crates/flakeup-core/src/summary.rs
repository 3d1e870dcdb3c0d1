//! Per-source outcome aggregation.

use std::collections::BTreeMap;

use serde::Serialize;

/// Final status of one source. Precedence when statuses accumulate:
/// error over updated over no-change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    NoChange,
    Updated,
    Error,
}

impl SummaryStatus {
    fn priority(self) -> u8 {
        match self {
            SummaryStatus::NoChange => 0,
            SummaryStatus::Updated => 1,
            SummaryStatus::Error => 2,
        }
    }
}

/// Aggregate of per-source update outcomes, in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct UpdateSummary {
    status_by_name: BTreeMap<String, SummaryStatus>,
    order: Vec<String>,
}

impl UpdateSummary {
    /// Record a status for a source, keeping the highest-precedence one.
    pub fn record(&mut self, name: &str, status: SummaryStatus) {
        match self.status_by_name.get(name) {
            None => {
                self.order.push(name.to_string());
                self.status_by_name.insert(name.to_string(), status);
            }
            Some(current) if status.priority() > current.priority() => {
                self.status_by_name.insert(name.to_string(), status);
            }
            Some(_) => {}
        }
    }

    /// Merge a batch of per-source statuses.
    pub fn accumulate(&mut self, details: &BTreeMap<String, SummaryStatus>) {
        for (name, status) in details {
            self.record(name, *status);
        }
    }

    fn with_status(&self, wanted: SummaryStatus) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.status_by_name.get(*name) == Some(&wanted))
            .cloned()
            .collect()
    }

    pub fn updated(&self) -> Vec<String> {
        self.with_status(SummaryStatus::Updated)
    }

    pub fn errors(&self) -> Vec<String> {
        self.with_status(SummaryStatus::Error)
    }

    pub fn no_change(&self) -> Vec<String> {
        self.with_status(SummaryStatus::NoChange)
    }

    pub fn had_errors(&self) -> bool {
        self.status_by_name
            .values()
            .any(|status| *status == SummaryStatus::Error)
    }

    /// The machine-readable summary payload.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "updated": self.updated(),
            "errors": self.errors(),
            "noChange": self.no_change(),
            "success": !self.had_errors(),
        })
    }
}

/// Everything a caller needs after a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: UpdateSummary,
    /// 1 when any source errored, 0 otherwise.
    pub exit_code: i32,
}

impl RunReport {
    pub fn from_summary(summary: UpdateSummary) -> Self {
        let exit_code = i32::from(summary.had_errors());
        Self { summary, exit_code }
    }
}

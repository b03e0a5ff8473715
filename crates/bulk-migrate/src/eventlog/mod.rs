//! Append-only audit log of batch outcomes.
//!
//! Unlike the progress ledger, which holds a single latest value, the event
//! log keeps one entry per batch, including batches that exhausted their
//! retries. Operators query failure entries to replay batches by hand.

mod jsonl;
mod memory;

pub use jsonl::JsonLinesEventLog;
pub use memory::MemoryEventLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::core::ScanPosition;
use crate::error::Result;

/// Whether a batch was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// One batch outcome entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub transfer_id: String,
    pub run_id: String,

    /// Batch sequence number within the transfer.
    pub batch_seq: u64,

    /// Number of records in the batch.
    pub records: usize,

    pub kind: OutcomeKind,

    /// Cause of the failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Write attempts made for this batch.
    pub attempts: u32,

    pub duration_ms: u64,

    /// Ledger position the batch was read from. Replaying a failed batch
    /// means fetching the page at this position again.
    pub start_position: ScanPosition,

    pub timestamp: DateTime<Utc>,
}

impl BatchOutcome {
    pub fn is_failure(&self) -> bool {
        self.kind == OutcomeKind::Failure
    }
}

/// Selection of outcomes returned by [`EventLog::query`].
///
/// Queries are finite and restartable: re-running the same filter with
/// `since_seq` set past the last entry seen continues where a previous
/// consumer stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeFilter {
    pub transfer_id: Option<String>,
    pub run_id: Option<String>,
    pub kind: Option<OutcomeKind>,

    /// Only entries with `batch_seq >= since_seq`.
    pub since_seq: Option<u64>,
}

impl OutcomeFilter {
    /// Match every entry.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match failure entries only.
    pub fn failures() -> Self {
        Self {
            kind: Some(OutcomeKind::Failure),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn for_transfer(mut self, transfer_id: impl Into<String>) -> Self {
        self.transfer_id = Some(transfer_id.into());
        self
    }

    #[must_use]
    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn since(mut self, batch_seq: u64) -> Self {
        self.since_seq = Some(batch_seq);
        self
    }

    /// Whether `outcome` is selected.
    pub fn matches(&self, outcome: &BatchOutcome) -> bool {
        self.transfer_id
            .as_deref()
            .map_or(true, |t| t == outcome.transfer_id)
            && self.run_id.as_deref().map_or(true, |r| r == outcome.run_id)
            && self.kind.map_or(true, |k| k == outcome.kind)
            && self.since_seq.map_or(true, |s| outcome.batch_seq >= s)
    }
}

/// Durable append-only log of [`BatchOutcome`]s.
///
/// Failures surface as [`crate::error::MigrateError::LogUnavailable`].
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one entry. Never overwrites earlier entries.
    async fn append(&self, outcome: &BatchOutcome) -> Result<()>;

    /// Lazily stream entries matching `filter`, in append order.
    fn query(&self, filter: OutcomeFilter) -> BoxStream<'_, Result<BatchOutcome>>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

#[cfg(test)]
pub(crate) fn sample_outcome(run_id: &str, batch_seq: u64, kind: OutcomeKind) -> BatchOutcome {
    BatchOutcome {
        transfer_id: "things-to-es".into(),
        run_id: run_id.into(),
        batch_seq,
        records: 500,
        kind,
        error: (kind == OutcomeKind::Failure).then(|| "bulk request returned 503".to_string()),
        attempts: 1,
        duration_ms: 12,
        start_position: ScanPosition::Start,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matching() {
        let ok = sample_outcome("r1", 3, OutcomeKind::Success);
        let failed = sample_outcome("r2", 4, OutcomeKind::Failure);

        assert!(OutcomeFilter::all().matches(&ok));
        assert!(!OutcomeFilter::failures().matches(&ok));
        assert!(OutcomeFilter::failures().for_run("r2").matches(&failed));
        assert!(!OutcomeFilter::all().for_run("r1").matches(&failed));
        assert!(!OutcomeFilter::all().since(4).matches(&ok));
        assert!(OutcomeFilter::all().since(4).matches(&failed));
        assert!(!OutcomeFilter::all().for_transfer("other").matches(&ok));
    }
}

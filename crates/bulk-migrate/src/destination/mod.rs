//! Destination bulk writers.
//!
//! A [`BulkWriter`] submits one batch as a single bulk upsert keyed by each
//! document's identifier. Writing the same document twice leaves the
//! destination unchanged after the first success, which is what makes
//! at-least-once delivery safe.
//!
//! Two failure shapes are distinguished:
//!
//! - the call itself fails (`Err`): the whole batch is retried as a unit;
//! - the call succeeds but some items fail: reported per item in [`BulkResult`].

mod elasticsearch;
mod memory;

pub use elasticsearch::{ElasticsearchConfig, ElasticsearchWriter};
pub use memory::MemoryDestination;

use async_trait::async_trait;

use crate::error::Result;
use crate::transform::DestinationDoc;

/// Outcome of one document within a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    /// The document was upserted.
    Ok,

    /// The document was not written.
    Failed {
        /// Destination-supplied reason.
        reason: String,
        /// Whether resubmitting the same document can succeed
        /// (throttling, unavailable shard) as opposed to a permanent rejection.
        retryable: bool,
    },
}

impl ItemStatus {
    /// Whether the item was written.
    pub fn is_ok(&self) -> bool {
        matches!(self, ItemStatus::Ok)
    }
}

/// Per-item outcome of a bulk write.
#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    /// One status per submitted document, in submission order.
    pub items: Vec<ItemStatus>,

    /// True if any item failed.
    pub any_errors: bool,
}

impl BulkResult {
    /// Build a result from item statuses.
    pub fn from_items(items: Vec<ItemStatus>) -> Self {
        let any_errors = items.iter().any(|i| !i.is_ok());
        Self { items, any_errors }
    }

    /// Number of failed items.
    pub fn failed_count(&self) -> usize {
        self.items.iter().filter(|i| !i.is_ok()).count()
    }

    /// True if at least one failed item can never succeed on resubmission.
    pub fn has_permanent_failures(&self) -> bool {
        self.items
            .iter()
            .any(|i| matches!(i, ItemStatus::Failed { retryable: false, .. }))
    }

    /// Short description of the failed items for logs and outcomes.
    pub fn failure_summary(&self) -> String {
        let first = self.items.iter().find_map(|i| match i {
            ItemStatus::Failed { reason, .. } => Some(reason.as_str()),
            ItemStatus::Ok => None,
        });
        format!(
            "{} of {} items failed (first: {})",
            self.failed_count(),
            self.items.len(),
            first.unwrap_or("n/a")
        )
    }
}

/// Bulk upsert into the destination store.
#[async_trait]
pub trait BulkWriter: Send + Sync {
    /// Upsert `docs` in one bulk call.
    async fn write_batch(&self, docs: &[DestinationDoc]) -> Result<BulkResult>;

    /// Verify the destination is reachable.
    async fn health_check(&self) -> Result<()>;

    /// Get the destination type name for logging/debugging.
    fn destination_type(&self) -> &'static str;
}

//! Progress ledger: the durable resume checkpoint.
//!
//! The [`ProgressLedger`] trait decouples checkpoint storage from the
//! orchestrator, which works with `Arc<dyn ProgressLedger>` without knowing
//! the concrete type. One [`ProgressRecord`] is stored per transfer identity
//! and overwritten on every committed batch.
//!
//! - **File**: [`FileLedger`], one signed JSON file per transfer
//! - **Memory**: [`MemoryLedger`], for tests

mod file;
mod memory;

pub use file::FileLedger;
pub use memory::MemoryLedger;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ScanPosition;
use crate::error::{MigrateError, Result};

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(MigrateError::Config(format!("Invalid run status: {}", s))),
        }
    }
}

/// Checkpoint for one transfer identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Transfer identity this checkpoint belongs to.
    pub transfer_id: String,

    /// Run that last wrote the checkpoint.
    pub run_id: String,

    /// Position after the last batch confirmed fully written.
    pub position: ScanPosition,

    /// Records written across all runs since the last reset.
    pub records_total: u64,

    /// Sequence number of the last committed batch (0 = none).
    pub batch_seq: u64,

    pub status: RunStatus,

    pub started_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// HMAC-SHA256 over the record without this field. Set by durable ledgers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl ProgressRecord {
    /// Fresh checkpoint at the start of the scan.
    pub fn new(transfer_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: transfer_id.into(),
            run_id: run_id.into(),
            position: ScanPosition::Start,
            records_total: 0,
            batch_seq: 0,
            status: RunStatus::Running,
            started_at: now,
            updated_at: now,
            hmac: None,
        }
    }

    /// Record a committed batch.
    pub fn advance(&mut self, batch_seq: u64, position: ScanPosition, records: u64) {
        self.batch_seq = batch_seq;
        self.position = position;
        self.records_total += records;
        self.updated_at = Utc::now();
    }

    /// Change the run status without moving the position.
    pub fn mark(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Trait for progress checkpoint backends.
///
/// # Contract
///
/// - `save` is last-write-wins for the record's `transfer_id`.
/// - Only one orchestrator writes a given transfer identity at a time; the
///   backend does not arbitrate between concurrent writers.
/// - Failures surface as [`MigrateError::LedgerUnavailable`].
#[async_trait]
pub trait ProgressLedger: Send + Sync {
    /// Store `record`, replacing any previous record for its transfer.
    async fn save(&self, record: &ProgressRecord) -> Result<()>;

    /// Load the record for `transfer_id`, if any.
    async fn load(&self, transfer_id: &str) -> Result<Option<ProgressRecord>>;

    /// Remove the record for `transfer_id`. Removing a missing record is not an error.
    async fn clear(&self, transfer_id: &str) -> Result<()>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

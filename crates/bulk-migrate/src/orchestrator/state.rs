//! Orchestrator states and run results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ScanPosition;
use crate::error::{Result, EXIT_BATCH_FAILED, EXIT_SOURCE_ERROR};

/// Transfer state machine.
///
/// ```text
/// Idle -> Resuming -> Extracting -> Transforming -> Loading -> Recording -> Extracting ...
///                         |                            |
///                         +----------> Failing <-------+
///                         |
///                         +-> Draining -> Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    Resuming,
    Extracting,
    Transforming,
    Loading,
    Recording,
    Draining,
    Done,
    Failing,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Idle => "idle",
            TransferState::Resuming => "resuming",
            TransferState::Extracting => "extracting",
            TransferState::Transforming => "transforming",
            TransferState::Loading => "loading",
            TransferState::Recording => "recording",
            TransferState::Draining => "draining",
            TransferState::Done => "done",
            TransferState::Failing => "failing",
        };
        f.write_str(name)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// The source was exhausted and every batch committed.
    Completed,
    /// A batch could not be extracted or written.
    Failed,
    /// Stopped by the cancellation signal after committing in-flight batches.
    Cancelled,
}

/// Pipeline stage where a batch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Extract,
    Load,
}

/// The batch that stopped a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub batch_seq: u64,
    pub stage: FailureStage,
    pub cause: String,

    /// Last durable checkpoint. A resume restarts from here.
    pub checkpoint: ScanPosition,
}

impl BatchFailure {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self.stage {
            FailureStage::Extract => EXIT_SOURCE_ERROR,
            FailureStage::Load => EXIT_BATCH_FAILED,
        }
    }
}

/// Result of a transfer run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub transfer_id: String,

    /// Unique run identifier.
    pub run_id: String,

    pub terminal_state: TerminalState,

    /// Records written since the last reset, across runs.
    pub total_records: u64,

    /// Records written by this run.
    pub run_records: u64,

    /// Batches committed by this run.
    pub batches: u64,

    /// Total duration in seconds.
    pub elapsed_seconds: f64,

    /// Average throughput of this run (records/second).
    pub records_per_second: f64,

    /// Ledger position when the run ended.
    pub checkpoint: ScanPosition,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<BatchFailure>,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.terminal_state == TerminalState::Completed
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

//! Progress observers.
//!
//! The orchestrator calls its observer after every `observe_every` committed
//! batches and once when the run ends. Observers run inline on the commit
//! path, so their output is ordered with respect to ledger commits.

use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::orchestrator::TransferState;

/// Point-in-time view of a running transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub transfer_id: String,
    pub run_id: String,
    pub state: TransferState,

    /// Last committed batch sequence number.
    pub batch_seq: u64,

    /// Batches committed by this run.
    pub batches_committed: u64,

    /// Records committed by this run.
    pub run_records: u64,

    /// Records committed since the last reset, across runs.
    pub total_records: u64,

    pub elapsed_seconds: f64,
    pub records_per_second: f64,

    /// Ledger position, rendered for display.
    pub position: String,
}

/// Receives progress snapshots from the orchestrator.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

/// Writes a `tracing` info line per snapshot.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl ProgressObserver for LoggingObserver {
    fn on_progress(&self, s: &ProgressSnapshot) {
        info!(
            "{}: batch {} ({:?}), {} records this run, {} total, {:.0} rec/s, position {}",
            s.transfer_id,
            s.batch_seq,
            s.state,
            s.run_records,
            s.total_records,
            s.records_per_second,
            s.position
        );
    }
}

/// Writes each snapshot as one JSON line.
pub struct JsonProgressObserver<W: Write + Send> {
    out: Mutex<W>,
}

impl JsonProgressObserver<std::io::Stderr> {
    /// Observer writing to stderr, leaving stdout for the final summary.
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write + Send> JsonProgressObserver<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<W: Write + Send> ProgressObserver for JsonProgressObserver<W> {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let Ok(line) = serde_json::to_string(snapshot) else {
            return;
        };
        if let Ok(mut out) = self.out.lock() {
            // Progress output is best effort.
            let _ = writeln!(out, "{}", line);
            let _ = out.flush();
        }
    }
}

//! # bulk-migrate
//!
//! Resumable bulk transfer of keyed, timestamped records from a paginated
//! source into a bulk-indexed document store.
//!
//! - **Pipelined batches**: one page is fetched ahead while up to
//!   `concurrency` batches are written
//! - **Durable checkpoints** committed in batch order, so a restart never
//!   skips records
//! - **Idempotent writes** keyed by natural key + timestamp, so replaying a
//!   batch is harmless
//! - **Audit log** of every batch outcome, failures included
//!
//! ## Example
//!
//! ```rust,no_run
//! use bulk_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> bulk_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::from_config(&config)?;
//!     let summary = orchestrator.run(true, CancellationToken::new()).await?;
//!     println!("Transferred {} records", summary.run_records);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod destination;
pub mod error;
pub mod eventlog;
pub mod ledger;
pub mod observer;
pub mod orchestrator;
pub mod source;
pub mod transform;

// Re-exports for convenient access
pub use config::Config;
pub use crate::core::{ContinuationToken, FieldValue, Page, Record, ScanPosition};
pub use destination::{BulkResult, BulkWriter, ItemStatus};
pub use error::{MigrateError, Result};
pub use eventlog::{BatchOutcome, EventLog, OutcomeFilter, OutcomeKind};
pub use ledger::{ProgressLedger, ProgressRecord, RunStatus};
pub use observer::{JsonProgressObserver, LoggingObserver, ProgressObserver, ProgressSnapshot};
pub use orchestrator::{Orchestrator, Summary, TerminalState, TransferConfig, TransferState};
pub use source::SourceCursor;
pub use transform::{BinaryEncoding, DestinationDoc, DocTransformer};

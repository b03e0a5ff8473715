//! Transfer orchestrator - drives extract, transform, load and checkpoint.
//!
//! A run is a pipeline of two stages:
//!
//! - one extraction task fetches pages sequentially (each fetch needs the
//!   previous page's token) and transforms them into batches, feeding a
//!   bounded channel;
//! - the commit loop loads up to `concurrency` batches at once and consumes
//!   their completions in batch-sequence order. Each ledger commit and
//!   success outcome is applied before the next completion is looked at, so
//!   the checkpoint never moves past a batch that was not durably written.
//!
//! A failed batch stops the run. Batches already being written are allowed
//! to finish but are not committed; their records are re-read on resume.

mod retry;
mod state;

pub use state::{BatchFailure, FailureStage, Summary, TerminalState, TransferState};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{BoxStream, FuturesOrdered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::ScanPosition;
use crate::destination::BulkWriter;
use crate::error::{MigrateError, Result};
use crate::eventlog::{BatchOutcome, EventLog, OutcomeFilter, OutcomeKind};
use crate::ledger::{ProgressLedger, ProgressRecord, RunStatus};
use crate::observer::{ProgressObserver, ProgressSnapshot};
use crate::source::SourceCursor;
use crate::transform::{DestinationDoc, DocTransformer};
use retry::{backoff_delay, fetch_with_retry, with_timeout};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Transfer identity. Keys the ledger entry and tags outcomes.
    pub transfer_id: String,

    /// Maximum batches being written at once.
    pub concurrency: usize,

    /// Write attempts per batch before the run fails.
    pub max_attempts: u32,

    /// Base delay between retries (exponential backoff).
    pub retry_base_delay: Duration,

    /// Upper bound for a single backoff delay.
    pub retry_max_delay: Duration,

    /// Total backoff allowed for one page fetch.
    pub source_max_wait: Duration,

    /// Deadline for every store call.
    pub store_timeout: Duration,

    /// Notify the observer every N committed batches (0 = only at the end).
    pub observe_every: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            transfer_id: "default".to_string(),
            concurrency: 4,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            source_max_wait: Duration::from_secs(60),
            store_timeout: Duration::from_secs(30),
            observe_every: 10,
        }
    }
}

impl TransferConfig {
    /// Create a configuration with default values.
    pub fn new(transfer_id: impl Into<String>) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max.max(base);
        self
    }

    pub fn with_source_max_wait(mut self, wait: Duration) -> Self {
        self.source_max_wait = wait;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_observe_every(mut self, n: u64) -> Self {
        self.observe_every = n;
        self
    }
}

/// One transformed page on its way to the destination.
struct Batch {
    seq: u64,
    /// Position the page was fetched from.
    start: ScanPosition,
    /// Position after the page.
    end: ScanPosition,
    docs: Vec<DestinationDoc>,
}

/// Message from the extraction task.
enum Extracted {
    Batch(Batch),
    SourceFailed {
        seq: u64,
        start: ScanPosition,
        error: MigrateError,
        attempts: u32,
        elapsed: Duration,
    },
    Fatal(MigrateError),
    End(ScanPosition),
}

/// Completed pipeline step, consumed in sequence order.
enum Step {
    Written {
        batch: Batch,
        attempts: u32,
        elapsed: Duration,
    },
    Failed {
        seq: u64,
        start: ScanPosition,
        records: usize,
        stage: FailureStage,
        cause: String,
        attempts: u32,
        elapsed: Duration,
    },
    Fatal(MigrateError),
    End(ScanPosition),
}

enum Committed {
    Continue,
    End,
    Failed(BatchFailure),
}

#[derive(Debug, Default, Clone, Copy)]
struct RunStats {
    batches: u64,
    records: u64,
}

/// Transfer orchestrator.
pub struct Orchestrator {
    source: Arc<dyn SourceCursor>,
    destination: Arc<dyn BulkWriter>,
    ledger: Arc<dyn ProgressLedger>,
    event_log: Arc<dyn EventLog>,
    transformer: Arc<DocTransformer>,
    config: TransferConfig,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl Orchestrator {
    /// Create an orchestrator over explicit store handles.
    pub fn new(
        source: Arc<dyn SourceCursor>,
        destination: Arc<dyn BulkWriter>,
        ledger: Arc<dyn ProgressLedger>,
        event_log: Arc<dyn EventLog>,
        transformer: DocTransformer,
        config: TransferConfig,
    ) -> Self {
        Self {
            source,
            destination,
            ledger,
            event_log,
            transformer: Arc::new(transformer),
            config,
            observer: None,
        }
    }

    /// Create an orchestrator over the stores named in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            config.source.build(),
            config.destination.build()?,
            config.ledger.build(),
            config.event_log.build(),
            config.transformer(),
            config.transfer_config(),
        ))
    }

    /// Attach a progress observer.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Run the transfer.
    ///
    /// With `resume = false` the scan starts from the beginning and the
    /// stored checkpoint is overwritten. With `resume = true` it continues
    /// from the stored checkpoint, if any.
    ///
    /// A batch that cannot be extracted or written ends the run with
    /// [`TerminalState::Failed`] and the last durable checkpoint in the
    /// summary. Defects and checkpoint storage failures are returned as `Err`.
    pub async fn run(&self, resume: bool, cancel: CancellationToken) -> Result<Summary> {
        let started = Instant::now();
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let transfer_id = &self.config.transfer_id;

        debug!("{}: {}", transfer_id, TransferState::Idle);
        info!(
            "Starting transfer {} (run {}, resume: {}, source: {}, destination: {}, concurrency: {})",
            transfer_id,
            run_id,
            resume,
            self.source.source_type(),
            self.destination.destination_type(),
            self.config.concurrency
        );

        debug!("{}: {}", transfer_id, TransferState::Resuming);
        let mut progress = match self.load_checkpoint(resume).await? {
            Some(mut record) => {
                if record.position.is_exhausted() {
                    info!(
                        "{}: checkpoint is at end of stream, nothing to transfer",
                        transfer_id
                    );
                    debug!("{}: {}", transfer_id, TransferState::Done);
                    return Ok(self.summary(
                        &record,
                        &run_id,
                        TerminalState::Completed,
                        RunStats::default(),
                        started,
                        started_at,
                        None,
                    ));
                }
                info!(
                    "Resuming {} from batch {} ({} records, {})",
                    transfer_id, record.batch_seq, record.records_total, record.position
                );
                record.run_id = run_id.clone();
                record.mark(RunStatus::Running);
                record
            }
            None => ProgressRecord::new(transfer_id.clone(), run_id.clone()),
        };
        self.save_progress(&progress).await?;

        let (tx, mut rx) = mpsc::channel::<Extracted>(self.config.concurrency);
        let extract_cancel = cancel.child_token();
        let extractor = tokio::spawn(extract(
            self.source.clone(),
            self.transformer.clone(),
            self.config.clone(),
            progress.position.clone(),
            progress.batch_seq,
            tx,
            extract_cancel.clone(),
        ));

        let mut in_flight: FuturesOrdered<BoxFuture<'_, Step>> = FuturesOrdered::new();
        let mut accepting = true;
        let mut reached_end = false;
        let mut failure: Option<BatchFailure> = None;
        let mut fatal: Option<MigrateError> = None;
        let mut stats = RunStats::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled(), if accepting => {
                    info!(
                        "Cancellation requested, finishing {} in-flight batches",
                        in_flight.len()
                    );
                    accepting = false;
                }
                msg = rx.recv(), if accepting && in_flight.len() < self.config.concurrency => {
                    match msg {
                        Some(msg) => in_flight.push_back(self.dispatch(msg)),
                        None => accepting = false,
                    }
                }
                Some(step) = in_flight.next(), if !in_flight.is_empty() => {
                    if failure.is_some() || fatal.is_some() {
                        debug!("discarding completion after failure; it will be re-read on resume");
                        continue;
                    }
                    match self.commit(step, &mut progress, &mut stats, started).await {
                        Ok(Committed::Continue) => {}
                        Ok(Committed::End) => reached_end = true,
                        Ok(Committed::Failed(f)) => {
                            failure = Some(f);
                            accepting = false;
                            extract_cancel.cancel();
                        }
                        Err(e) => {
                            fatal = Some(e);
                            accepting = false;
                            extract_cancel.cancel();
                        }
                    }
                }
                else => break,
            }
        }

        drop(rx);
        if let Err(e) = extractor.await {
            if fatal.is_none() && failure.is_none() {
                fatal = Some(MigrateError::SourceUnavailable(format!(
                    "extraction task failed: {}",
                    e
                )));
            }
        }

        if let Some(e) = fatal {
            error!("Transfer {} aborted: {}", transfer_id, e);
            progress.mark(RunStatus::Failed);
            if let Err(save_err) = self.save_progress(&progress).await {
                warn!("Could not record failed status: {}", save_err);
            }
            return Err(e);
        }

        let terminal = if failure.is_some() {
            TerminalState::Failed
        } else if reached_end || progress.position.is_exhausted() {
            progress.mark(RunStatus::Completed);
            self.save_progress(&progress).await?;
            TerminalState::Completed
        } else {
            progress.mark(RunStatus::Cancelled);
            self.save_progress(&progress).await?;
            TerminalState::Cancelled
        };

        let final_state = match terminal {
            TerminalState::Failed => TransferState::Failing,
            _ => TransferState::Done,
        };
        debug!("{}: {}", transfer_id, final_state);
        self.notify(&progress, final_state, stats, started);

        let summary = self.summary(
            &progress,
            &run_id,
            terminal,
            stats,
            started,
            started_at,
            failure,
        );
        info!(
            "Transfer {} {:?}: {} records this run ({} total) in {:.1}s ({:.0} rec/s), checkpoint {}",
            transfer_id,
            summary.terminal_state,
            summary.run_records,
            summary.total_records,
            summary.elapsed_seconds,
            summary.records_per_second,
            summary.checkpoint
        );
        Ok(summary)
    }

    /// Clear the stored checkpoint so the next run re-scans from the start.
    pub async fn reset(&self) -> Result<()> {
        with_timeout(
            self.config.store_timeout,
            "ledger clear",
            MigrateError::LedgerUnavailable,
            self.ledger.clear(&self.config.transfer_id),
        )
        .await?;
        info!("Cleared checkpoint for {}", self.config.transfer_id);
        Ok(())
    }

    /// Stored checkpoint for this transfer, if any.
    pub async fn status(&self) -> Result<Option<ProgressRecord>> {
        with_timeout(
            self.config.store_timeout,
            "ledger load",
            MigrateError::LedgerUnavailable,
            self.ledger.load(&self.config.transfer_id),
        )
        .await
    }

    /// Stream this transfer's outcomes matching `filter`.
    pub fn outcomes(&self, filter: OutcomeFilter) -> BoxStream<'_, Result<BatchOutcome>> {
        self.event_log
            .query(filter.for_transfer(self.config.transfer_id.clone()))
    }

    /// Check that every store answers.
    pub async fn health_check(&self) -> Result<()> {
        let timeout = self.config.store_timeout;

        with_timeout(
            timeout,
            "source health check",
            MigrateError::SourceUnavailable,
            self.source.fetch_page(None),
        )
        .await?;
        info!("source ({}) ok", self.source.source_type());

        with_timeout(
            timeout,
            "destination health check",
            MigrateError::DestinationWrite,
            self.destination.health_check(),
        )
        .await?;
        info!("destination ({}) ok", self.destination.destination_type());

        self.status().await?;
        info!("ledger ({}) ok", self.ledger.backend_type());

        let mut entries = self.event_log.query(OutcomeFilter::all());
        with_timeout(
            timeout,
            "event log health check",
            MigrateError::LogUnavailable,
            async { entries.next().await.transpose() },
        )
        .await?;
        info!("event log ({}) ok", self.event_log.backend_type());

        Ok(())
    }

    async fn load_checkpoint(&self, resume: bool) -> Result<Option<ProgressRecord>> {
        if !resume {
            return Ok(None);
        }
        self.status().await
    }

    async fn save_progress(&self, progress: &ProgressRecord) -> Result<()> {
        with_timeout(
            self.config.store_timeout,
            "ledger save",
            MigrateError::LedgerUnavailable,
            self.ledger.save(progress),
        )
        .await
    }

    async fn append_outcome(&self, outcome: &BatchOutcome) -> Result<()> {
        with_timeout(
            self.config.store_timeout,
            "event log append",
            MigrateError::LogUnavailable,
            self.event_log.append(outcome),
        )
        .await
    }

    fn dispatch(&self, msg: Extracted) -> BoxFuture<'_, Step> {
        match msg {
            Extracted::Batch(batch) => self.load(batch).boxed(),
            Extracted::SourceFailed {
                seq,
                start,
                error,
                attempts,
                elapsed,
            } => future::ready(Step::Failed {
                seq,
                start,
                records: 0,
                stage: FailureStage::Extract,
                cause: error.to_string(),
                attempts,
                elapsed,
            })
            .boxed(),
            Extracted::Fatal(e) => future::ready(Step::Fatal(e)).boxed(),
            Extracted::End(position) => future::ready(Step::End(position)).boxed(),
        }
    }

    /// Write one batch, retrying the identical payload up to `max_attempts`.
    async fn load(&self, batch: Batch) -> Step {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(
                "batch {}: {} ({} docs, attempt {}/{})",
                batch.seq,
                TransferState::Loading,
                batch.docs.len(),
                attempt,
                max_attempts
            );

            let result = with_timeout(
                self.config.store_timeout,
                "bulk write",
                MigrateError::DestinationWrite,
                self.destination.write_batch(&batch.docs),
            )
            .await;

            let (cause, retryable) = match result {
                Ok(bulk) if !bulk.any_errors => {
                    return Step::Written {
                        batch,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                }
                Ok(bulk) => (bulk.failure_summary(), !bulk.has_permanent_failures()),
                Err(e) => {
                    let retryable = e.is_transient();
                    (e.to_string(), retryable)
                }
            };

            if !retryable || attempt >= max_attempts {
                return Step::Failed {
                    seq: batch.seq,
                    records: batch.docs.len(),
                    start: batch.start,
                    stage: FailureStage::Load,
                    cause,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }

            let delay = backoff_delay(
                self.config.retry_base_delay,
                self.config.retry_max_delay,
                attempt,
            );
            warn!(
                "batch {}: write failed, retry {}/{} in {:?}: {}",
                batch.seq,
                attempt,
                max_attempts - 1,
                delay,
                cause
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn commit(
        &self,
        step: Step,
        progress: &mut ProgressRecord,
        stats: &mut RunStats,
        started: Instant,
    ) -> Result<Committed> {
        match step {
            Step::Written {
                batch,
                attempts,
                elapsed,
            } => {
                debug!("batch {}: {}", batch.seq, TransferState::Recording);
                let records = batch.docs.len();
                progress.advance(batch.seq, batch.end.clone(), records as u64);
                self.save_progress(progress).await?;
                self.append_outcome(&BatchOutcome {
                    transfer_id: progress.transfer_id.clone(),
                    run_id: progress.run_id.clone(),
                    batch_seq: batch.seq,
                    records,
                    kind: OutcomeKind::Success,
                    error: None,
                    attempts,
                    duration_ms: elapsed.as_millis() as u64,
                    start_position: batch.start,
                    timestamp: Utc::now(),
                })
                .await?;

                stats.batches += 1;
                stats.records += records as u64;
                let every = self.config.observe_every;
                if every > 0 && stats.batches % every == 0 {
                    self.notify(progress, TransferState::Recording, *stats, started);
                }

                if batch.end.is_exhausted() {
                    debug!("batch {}: {}", batch.seq, TransferState::Draining);
                    Ok(Committed::End)
                } else {
                    Ok(Committed::Continue)
                }
            }
            Step::Failed {
                seq,
                start,
                records,
                stage,
                cause,
                attempts,
                elapsed,
            } => {
                error!(
                    "batch {}: {} after {} attempts: {}",
                    seq,
                    TransferState::Failing,
                    attempts,
                    cause
                );
                self.append_outcome(&BatchOutcome {
                    transfer_id: progress.transfer_id.clone(),
                    run_id: progress.run_id.clone(),
                    batch_seq: seq,
                    records,
                    kind: OutcomeKind::Failure,
                    error: Some(cause.clone()),
                    attempts,
                    duration_ms: elapsed.as_millis() as u64,
                    start_position: start,
                    timestamp: Utc::now(),
                })
                .await?;

                progress.mark(RunStatus::Failed);
                self.save_progress(progress).await?;

                Ok(Committed::Failed(BatchFailure {
                    batch_seq: seq,
                    stage,
                    cause,
                    checkpoint: progress.position.clone(),
                }))
            }
            Step::Fatal(e) => Err(e),
            Step::End(position) => {
                debug!(
                    "{}: {} at {}",
                    progress.transfer_id,
                    TransferState::Draining,
                    position
                );
                progress.position = position;
                Ok(Committed::End)
            }
        }
    }

    fn notify(
        &self,
        progress: &ProgressRecord,
        state: TransferState,
        stats: RunStats,
        started: Instant,
    ) {
        let Some(observer) = &self.observer else {
            return;
        };
        let elapsed = started.elapsed().as_secs_f64();
        observer.on_progress(&ProgressSnapshot {
            transfer_id: progress.transfer_id.clone(),
            run_id: progress.run_id.clone(),
            state,
            batch_seq: progress.batch_seq,
            batches_committed: stats.batches,
            run_records: stats.records,
            total_records: progress.records_total,
            elapsed_seconds: elapsed,
            records_per_second: rate(stats.records, elapsed),
            position: progress.position.to_string(),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn summary(
        &self,
        progress: &ProgressRecord,
        run_id: &str,
        terminal_state: TerminalState,
        stats: RunStats,
        started: Instant,
        started_at: chrono::DateTime<Utc>,
        failure: Option<BatchFailure>,
    ) -> Summary {
        let elapsed = started.elapsed().as_secs_f64();
        Summary {
            transfer_id: progress.transfer_id.clone(),
            run_id: run_id.to_string(),
            terminal_state,
            total_records: progress.records_total,
            run_records: stats.records,
            batches: stats.batches,
            elapsed_seconds: elapsed,
            records_per_second: rate(stats.records, elapsed),
            checkpoint: progress.position.clone(),
            started_at,
            completed_at: Utc::now(),
            failure,
        }
    }
}

fn rate(records: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        records as f64 / seconds
    } else {
        0.0
    }
}

/// Extraction task: fetch and transform pages in scan order.
async fn extract(
    source: Arc<dyn SourceCursor>,
    transformer: Arc<DocTransformer>,
    config: TransferConfig,
    mut position: ScanPosition,
    mut seq: u64,
    tx: mpsc::Sender<Extracted>,
    cancel: CancellationToken,
) {
    loop {
        debug!("batch {}: {} from {}", seq + 1, TransferState::Extracting, position);
        let started = Instant::now();

        let (fetched, attempts) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            fetched = fetch_with_retry(source.as_ref(), position.token(), &config) => fetched,
        };

        let page = match fetched {
            Ok(page) => page,
            Err(error) => {
                let _ = tx
                    .send(Extracted::SourceFailed {
                        seq: seq + 1,
                        start: position,
                        error,
                        attempts,
                        elapsed: started.elapsed(),
                    })
                    .await;
                return;
            }
        };

        if page.is_empty() {
            let _ = tx
                .send(Extracted::End(ScanPosition::after_page(page.next_token)))
                .await;
            return;
        }

        seq += 1;
        debug!("batch {}: {} {} records", seq, TransferState::Transforming, page.len());
        let docs = match transformer.transform(&page.records) {
            Ok(docs) => docs,
            Err(e) => {
                let _ = tx.send(Extracted::Fatal(e)).await;
                return;
            }
        };

        let end = ScanPosition::after_page(page.next_token);
        let last = end.is_exhausted();
        let start = std::mem::replace(&mut position, end.clone());
        let batch = Batch {
            seq,
            start,
            end,
            docs,
        };
        if tx.send(Extracted::Batch(batch)).await.is_err() || last {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContinuationToken, Record};
    use crate::destination::MemoryDestination;
    use crate::eventlog::MemoryEventLog;
    use crate::ledger::MemoryLedger;
    use crate::source::MemorySource;
    use crate::transform::{BinaryEncoding, KEY_FIELD};
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                Record::new(
                    format!("thing-{:05}", i),
                    Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                )
                .with_field("value", vec![(i % 256) as u8])
                .with_field("model_id", i as i64)
            })
            .collect()
    }

    struct Harness {
        records: Vec<Record>,
        source: Arc<MemorySource>,
        dest: Arc<MemoryDestination>,
        ledger: Arc<MemoryLedger>,
        log: Arc<MemoryEventLog>,
    }

    impl Harness {
        fn new(records: Vec<Record>, page_size: usize) -> Self {
            Self {
                source: Arc::new(MemorySource::new(records.clone(), page_size)),
                records,
                dest: Arc::new(MemoryDestination::new()),
                ledger: Arc::new(MemoryLedger::new()),
                log: Arc::new(MemoryEventLog::new()),
            }
        }

        fn orchestrator(&self, config: TransferConfig) -> Orchestrator {
            Orchestrator::new(
                self.source.clone(),
                self.dest.clone(),
                self.ledger.clone(),
                self.log.clone(),
                DocTransformer::new().with_binary_field("value", BinaryEncoding::Hex),
                config,
            )
        }

        fn id(&self, index: usize) -> String {
            self.records[index].document_id()
        }

        fn outcomes(&self, kind: OutcomeKind) -> Vec<BatchOutcome> {
            self.log
                .entries()
                .into_iter()
                .filter(|o| o.kind == kind)
                .collect()
        }
    }

    fn config() -> TransferConfig {
        TransferConfig::new("things-to-es")
            .with_retry_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_source_max_wait(Duration::from_millis(50))
            .with_store_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_three_pages_complete_to_end_of_stream() {
        let h = Harness::new(records(1250), 500);
        let summary = h
            .orchestrator(config())
            .run(false, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.terminal_state, TerminalState::Completed);
        assert_eq!(summary.total_records, 1250);
        assert_eq!(summary.batches, 3);
        assert_eq!(h.outcomes(OutcomeKind::Success).len(), 3);
        assert!(h.outcomes(OutcomeKind::Failure).is_empty());
        assert_eq!(h.dest.len(), 1250);

        let stored = h.ledger.load("things-to-es").await.unwrap().unwrap();
        assert_eq!(stored.position, ScanPosition::Exhausted);
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.batch_seq, 3);
    }

    #[tokio::test]
    async fn test_failed_page_keeps_checkpoint_and_resume_recovers() {
        let h = Harness::new(records(1250), 500);
        h.dest.fail_batches_containing(h.id(500), 3);
        let orch = h.orchestrator(config().with_max_attempts(3));

        let summary = orch.run(false, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Failed);
        let failure = summary.failure.unwrap();
        assert_eq!(failure.batch_seq, 2);
        assert_eq!(failure.stage, FailureStage::Load);
        assert_eq!(failure.exit_code(), crate::error::EXIT_BATCH_FAILED);

        let stored = orch.status().await.unwrap().unwrap();
        assert_eq!(stored.records_total, 500);
        assert_eq!(stored.batch_seq, 1);
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(failure.checkpoint, stored.position);

        let failures = h.outcomes(OutcomeKind::Failure);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 3);
        assert_eq!(failures[0].batch_seq, 2);
        assert_eq!(failures[0].start_position, stored.position);
        assert_eq!(h.outcomes(OutcomeKind::Success).len(), 1);

        let resumed = orch.run(true, CancellationToken::new()).await.unwrap();
        assert_eq!(resumed.terminal_state, TerminalState::Completed);
        assert_eq!(resumed.total_records, 1250);
        assert_eq!(resumed.run_records, 750);
        assert_eq!(h.dest.len(), 1250);

        let resumed_seqs: Vec<u64> = h
            .outcomes(OutcomeKind::Success)
            .iter()
            .filter(|o| o.run_id == resumed.run_id)
            .map(|o| o.batch_seq)
            .collect();
        assert_eq!(resumed_seqs, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_reset_then_rerun_keeps_document_count() {
        let h = Harness::new(records(1250), 500);
        let orch = h.orchestrator(config());
        orch.run(false, CancellationToken::new()).await.unwrap();

        orch.reset().await.unwrap();
        assert!(orch.status().await.unwrap().is_none());

        let summary = orch.run(true, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.run_records, 1250);
        assert_eq!(h.dest.len(), 1250);
        assert_eq!(h.dest.write_count(), 2500);
    }

    #[tokio::test]
    async fn test_commits_follow_sequence_order_when_writes_finish_out_of_order() {
        let h = Harness::new(records(100), 10);
        h.dest.slow_batches_containing(h.id(0), Duration::from_millis(80));
        h.dest.set_latency(Duration::from_millis(5));

        let summary = h
            .orchestrator(config().with_concurrency(4))
            .run(false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Completed);
        assert!(h.dest.max_in_flight() >= 2);

        let committed: Vec<u64> = h
            .ledger
            .history()
            .iter()
            .filter(|r| r.status == RunStatus::Running && r.batch_seq > 0)
            .map(|r| r.batch_seq)
            .collect();
        assert_eq!(committed, (1..=10).collect::<Vec<_>>());

        let saves: Vec<ProgressRecord> = h
            .ledger
            .history()
            .into_iter()
            .filter(|r| r.status == RunStatus::Running)
            .collect();
        for pair in saves.windows(2) {
            assert!(pair[1].batch_seq > pair[0].batch_seq);
            assert!(pair[1].records_total >= pair[0].records_total);
            assert_ne!(pair[1].position, pair[0].position);
        }
        assert_eq!(
            saves.last().map(|r| &r.position),
            Some(&ScanPosition::Exhausted)
        );

        let logged: Vec<u64> = h.log.entries().iter().map(|o| o.batch_seq).collect();
        assert_eq!(logged, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let h = Harness::new(records(120), 10);
        h.dest.set_latency(Duration::from_millis(10));

        h.orchestrator(config().with_concurrency(3))
            .run(false, CancellationToken::new())
            .await
            .unwrap();
        assert!(h.dest.max_in_flight() <= 3);
        assert_eq!(h.dest.len(), 120);
    }

    #[tokio::test]
    async fn test_permanent_rejection_fails_without_retry() {
        let h = Harness::new(records(30), 10);
        h.dest.reject_item(h.id(3), false);

        let summary = h
            .orchestrator(config().with_concurrency(1))
            .run(false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Failed);
        assert_eq!(h.dest.call_count(), 1);

        let failures = h.outcomes(OutcomeKind::Failure);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 1);
        assert_eq!(summary.checkpoint, ScanPosition::Start);
    }

    #[tokio::test]
    async fn test_retryable_rejection_exhausts_budget() {
        let h = Harness::new(records(30), 10);
        h.dest.reject_item(h.id(3), true);

        let summary = h
            .orchestrator(config().with_concurrency(1))
            .run(false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Failed);
        assert_eq!(h.outcomes(OutcomeKind::Failure)[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_transient_write_failures_are_retried() {
        let h = Harness::new(records(30), 10);
        h.dest.fail_batches_containing(h.id(10), 2);

        let summary = h
            .orchestrator(config())
            .run(false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Completed);

        let second = h
            .log
            .entries()
            .into_iter()
            .find(|o| o.batch_seq == 2)
            .unwrap();
        assert_eq!(second.kind, OutcomeKind::Success);
        assert_eq!(second.attempts, 3);
    }

    #[tokio::test]
    async fn test_stale_token_fails_without_retry() {
        let h = Harness::new(records(30), 10);
        let mut stored = ProgressRecord::new("things-to-es", "old-run");
        stored.advance(1, ScanPosition::After(ContinuationToken::new("not!base64")), 10);
        h.ledger.save(&stored).await.unwrap();

        let summary = h
            .orchestrator(config())
            .run(true, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Failed);
        let failure = summary.failure.unwrap();
        assert_eq!(failure.stage, FailureStage::Extract);
        assert_eq!(failure.batch_seq, 2);
        assert!(failure.cause.contains("reset"));
        assert_eq!(h.source.fetch_count(), 1);
        assert_eq!(h.ledger.load("things-to-es").await.unwrap().unwrap().records_total, 10);
    }

    #[tokio::test]
    async fn test_source_outage_within_budget_recovers() {
        let h = Harness::new(records(30), 10);
        h.source.fail_next_fetches(2);

        let summary = h
            .orchestrator(config())
            .run(false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Completed);
        assert_eq!(h.dest.len(), 30);
    }

    #[tokio::test]
    async fn test_source_outage_beyond_budget_fails() {
        let h = Harness::new(records(30), 10);
        h.source.fail_next_fetches(1000);

        let summary = h
            .orchestrator(config().with_source_max_wait(Duration::from_millis(10)))
            .run(false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Failed);
        let failure = summary.failure.unwrap();
        assert_eq!(failure.exit_code(), crate::error::EXIT_SOURCE_ERROR);
        assert_eq!(failure.checkpoint, ScanPosition::Start);
        assert_eq!(h.outcomes(OutcomeKind::Failure)[0].records, 0);
        assert!(h.dest.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_checkpoint_resumes_to_done() {
        let h = Harness::new(records(25), 10);
        let orch = h.orchestrator(config());
        orch.run(false, CancellationToken::new()).await.unwrap();
        let fetches = h.source.fetch_count();

        let summary = orch.run(true, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Completed);
        assert_eq!(summary.run_records, 0);
        assert_eq!(summary.total_records, 25);
        assert_eq!(h.source.fetch_count(), fetches);
    }

    #[tokio::test]
    async fn test_empty_source_completes() {
        let h = Harness::new(Vec::new(), 10);
        let summary = h
            .orchestrator(config())
            .run(false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Completed);
        assert_eq!(summary.checkpoint, ScanPosition::Exhausted);
        assert!(h.log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_transform_defect_is_fatal() {
        let mut input = records(30);
        input[15] = input[15].clone().with_field(KEY_FIELD, "shadow");
        let h = Harness::new(input, 10);

        let err = h
            .orchestrator(config())
            .run(false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Transform { .. }));

        let stored = h.ledger.load("things-to-es").await.unwrap().unwrap();
        assert_eq!(stored.records_total, 10);
        assert_eq!(stored.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_microsecond_apart_records_do_not_collapse() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let input = vec![
            Record::new("thing-1", t).with_field("model_id", 1i64),
            Record::new("thing-1", t + chrono::Duration::microseconds(1)).with_field("model_id", 2i64),
        ];
        let h = Harness::new(input, 10);

        let err = h
            .orchestrator(config())
            .run(false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Transform { .. }));
        assert!(h.dest.is_empty());

        let stored = h.ledger.load("things-to-es").await.unwrap().unwrap();
        assert_eq!(stored.records_total, 0);
        assert_eq!(stored.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_ledger_unavailable_is_fatal() {
        let h = Harness::new(records(30), 10);
        h.ledger.set_unavailable(true);

        let err = h
            .orchestrator(config())
            .run(false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::LedgerUnavailable(_)));
        assert!(h.dest.is_empty());
    }

    #[tokio::test]
    async fn test_event_log_unavailable_is_fatal() {
        let h = Harness::new(records(30), 10);
        h.log.set_unavailable(true);

        let err = h
            .orchestrator(config())
            .run(false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::LogUnavailable(_)));
    }

    #[tokio::test]
    async fn test_cancel_before_start_issues_no_writes() {
        let h = Harness::new(records(30), 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h.orchestrator(config()).run(false, cancel).await.unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Cancelled);
        assert_eq!(h.dest.call_count(), 0);
        let stored = h.ledger.load("things-to-es").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(stored.position, ScanPosition::Start);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_commits_in_flight_and_resumes() {
        let h = Harness::new(records(200), 10);
        h.dest.set_latency(Duration::from_millis(20));
        let orch = h.orchestrator(config().with_concurrency(2));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let summary = orch.run(false, cancel).await.unwrap();
        assert_eq!(summary.terminal_state, TerminalState::Cancelled);

        let stored = orch.status().await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(stored.batch_seq, summary.batches);
        assert_eq!(h.outcomes(OutcomeKind::Success).len() as u64, summary.batches);
        assert_eq!(h.dest.len() as u64, stored.records_total);

        let resumed = orch.run(true, CancellationToken::new()).await.unwrap();
        assert_eq!(resumed.terminal_state, TerminalState::Completed);
        assert_eq!(h.dest.len(), 200);
        assert_eq!(resumed.total_records, 200);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressSnapshot>>);

    impl ProgressObserver for Recorder {
        fn on_progress(&self, snapshot: &ProgressSnapshot) {
            self.0.lock().unwrap().push(snapshot.clone());
        }
    }

    #[tokio::test]
    async fn test_observer_runs_every_n_batches_and_at_end() {
        let h = Harness::new(records(50), 10);
        let recorder = Arc::new(Recorder::default());

        h.orchestrator(config().with_observe_every(2))
            .with_observer(recorder.clone())
            .run(false, CancellationToken::new())
            .await
            .unwrap();

        let seen = recorder.0.lock().unwrap();
        let seqs: Vec<u64> = seen.iter().map(|s| s.batch_seq).collect();
        assert_eq!(seqs, vec![2, 4, 5]);
        assert_eq!(seen.last().unwrap().state, TransferState::Done);
        assert_eq!(seen.last().unwrap().total_records, 50);
    }

    #[tokio::test]
    async fn test_outcomes_stream_filters_by_transfer() {
        let h = Harness::new(records(30), 10);
        let orch = h.orchestrator(config());
        orch.run(false, CancellationToken::new()).await.unwrap();

        let entries: Vec<BatchOutcome> = orch
            .outcomes(OutcomeFilter::all())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(entries.len(), 3);
        orch.health_check().await.unwrap();
    }
}

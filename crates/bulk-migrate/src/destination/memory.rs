//! In-memory destination with upsert semantics and failure injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{BulkResult, BulkWriter, ItemStatus};
use crate::error::{MigrateError, Result};
use crate::transform::DestinationDoc;

#[derive(Default)]
struct Faults {
    /// Fail the next N calls outright.
    fail_next: usize,
    /// Fail calls whose batch contains this id, N more times.
    fail_batches_with: HashMap<String, usize>,
    /// Item-level rejections: id -> retryable.
    reject: HashMap<String, bool>,
    /// Extra latency for batches containing an id.
    slow: HashMap<String, Duration>,
}

/// Destination that keeps upserted documents in memory.
#[derive(Default)]
pub struct MemoryDestination {
    docs: Mutex<BTreeMap<String, Map<String, Value>>>,
    faults: Mutex<Faults>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
    writes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryDestination {
    /// Create an empty destination.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` bulk calls with a transport error.
    pub fn fail_next_writes(&self, n: usize) {
        self.lock_faults().fail_next = n;
    }

    /// Fail the next `n` bulk calls whose batch contains `doc_id`.
    pub fn fail_batches_containing(&self, doc_id: impl Into<String>, n: usize) {
        self.lock_faults().fail_batches_with.insert(doc_id.into(), n);
    }

    /// Reject `doc_id` at item level on every write.
    pub fn reject_item(&self, doc_id: impl Into<String>, retryable: bool) {
        self.lock_faults().reject.insert(doc_id.into(), retryable);
    }

    /// Stop rejecting `doc_id`.
    pub fn accept_item(&self, doc_id: &str) {
        self.lock_faults().reject.remove(doc_id);
    }

    /// Delay every bulk call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Delay bulk calls whose batch contains `doc_id` by `latency`.
    pub fn slow_batches_containing(&self, doc_id: impl Into<String>, latency: Duration) {
        self.lock_faults().slow.insert(doc_id.into(), latency);
    }

    /// Number of distinct documents stored.
    pub fn len(&self) -> usize {
        self.lock_docs().len()
    }

    /// Whether no documents are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored body for `id`.
    pub fn get(&self, id: &str) -> Option<Map<String, Value>> {
        self.lock_docs().get(id).cloned()
    }

    /// All stored ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.lock_docs().keys().cloned().collect()
    }

    /// Number of bulk calls received, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of successful item writes, counting overwrites.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Highest number of bulk calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock_docs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Map<String, Value>>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn latency_for(&self, docs: &[DestinationDoc]) -> Duration {
        let base = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        let faults = self.lock_faults();
        docs.iter()
            .filter_map(|d| faults.slow.get(&d.id).copied())
            .fold(base, Duration::max)
    }

    async fn write_inner(&self, docs: &[DestinationDoc]) -> Result<BulkResult> {
        let latency = self.latency_for(docs);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(reason) = self.take_call_failure(docs) {
            return Err(MigrateError::DestinationWrite(reason));
        }

        let reject = self.lock_faults().reject.clone();
        let mut stored = self.lock_docs();
        let items = docs
            .iter()
            .map(|doc| match reject.get(&doc.id) {
                Some(&retryable) => ItemStatus::Failed {
                    reason: format!("rejected {}", doc.id),
                    retryable,
                },
                None => {
                    stored.insert(doc.id.clone(), doc.body.clone());
                    self.writes.fetch_add(1, Ordering::SeqCst);
                    ItemStatus::Ok
                }
            })
            .collect();

        Ok(BulkResult::from_items(items))
    }

    /// Decide whether this call fails outright. Consumes one injected failure.
    fn take_call_failure(&self, docs: &[DestinationDoc]) -> Option<String> {
        let mut faults = self.lock_faults();
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return Some("injected transport failure".into());
        }
        for doc in docs {
            if let Some(remaining) = faults.fail_batches_with.get_mut(&doc.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Some(format!("injected failure for batch containing {}", doc.id));
                }
            }
        }
        None
    }
}

#[async_trait]
impl BulkWriter for MemoryDestination {
    async fn write_batch(&self, docs: &[DestinationDoc]) -> Result<BulkResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.write_inner(docs).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn destination_type(&self) -> &'static str {
        "memory"
    }
}

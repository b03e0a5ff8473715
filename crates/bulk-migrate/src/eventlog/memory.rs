//! In-memory event log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::{BatchOutcome, EventLog, OutcomeFilter};
use crate::error::{MigrateError, Result};

#[derive(Default)]
pub struct MemoryEventLog {
    entries: Mutex<Vec<BatchOutcome>>,
    unavailable: AtomicBool,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail with `LogUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of all entries in append order.
    pub fn entries(&self) -> Vec<BatchOutcome> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, outcome: &BatchOutcome) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MigrateError::LogUnavailable(
                "memory log marked unavailable".into(),
            ));
        }
        self.entries
            .lock()
            .map_err(|_| MigrateError::LogUnavailable("lock poisoned".into()))?
            .push(outcome.clone());
        Ok(())
    }

    fn query(&self, filter: OutcomeFilter) -> BoxStream<'_, Result<BatchOutcome>> {
        let selected: Vec<Result<BatchOutcome>> = self
            .entries()
            .into_iter()
            .filter(|o| filter.matches(o))
            .map(Ok)
            .collect();
        stream::iter(selected).boxed()
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

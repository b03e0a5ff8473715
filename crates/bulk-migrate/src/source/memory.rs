//! In-memory source with keyset pagination.
//!
//! Records are kept sorted by `(key, timestamp)`. A token stores the scan key
//! of the last record handed out, and the next page starts strictly after it,
//! so records inserted behind the cursor are never re-read and records
//! inserted ahead of it are never skipped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{decode_token, encode_token, SourceCursor};
use crate::core::{ContinuationToken, Page, Record};
use crate::error::{MigrateError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct KeysetPosition {
    key: String,
    timestamp: DateTime<Utc>,
}

/// Source backed by a sorted in-memory record set.
pub struct MemorySource {
    records: RwLock<Vec<Record>>,
    page_size: usize,
    fail_next: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemorySource {
    /// Create a source over `records`, paging `page_size` at a time.
    pub fn new(mut records: Vec<Record>, page_size: usize) -> Self {
        records.sort_by(|a, b| a.scan_key().cmp(&b.scan_key()));
        Self {
            records: RwLock::new(records),
            page_size: page_size.max(1),
            fail_next: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` fetches fail with `SourceUnavailable`.
    pub fn fail_next_fetches(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of fetch calls served, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Insert a record, keeping scan order. Replaces a record with the same id.
    pub fn insert(&self, record: Record) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        match records.binary_search_by(|r| r.scan_key().cmp(&record.scan_key())) {
            Ok(idx) => records[idx] = record,
            Err(idx) => records.insert(idx, record),
        }
    }

    /// Total number of records currently held.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the source holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SourceCursor for MemorySource {
    async fn fetch_page(&self, token: Option<&ContinuationToken>) -> Result<Page> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MigrateError::SourceUnavailable(
                "injected source failure".into(),
            ));
        }

        let after = token.map(decode_token::<KeysetPosition>).transpose()?;

        let records = self
            .records
            .read()
            .map_err(|_| MigrateError::SourceUnavailable("record set lock poisoned".into()))?;

        let start = match &after {
            Some(pos) => {
                let bound = (pos.key.as_str(), pos.timestamp);
                records.partition_point(|r| r.scan_key() <= bound)
            }
            None => 0,
        };
        let end = (start + self.page_size).min(records.len());
        let page: Vec<Record> = records[start..end].to_vec();

        let next_token = match page.last() {
            Some(last) if end < records.len() => Some(encode_token(&KeysetPosition {
                key: last.key.clone(),
                timestamp: last.timestamp,
            })?),
            _ => None,
        };

        debug!(
            "memory source: served records {}..{} of {}",
            start,
            end,
            records.len()
        );

        Ok(Page {
            records: page,
            next_token,
        })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn source_type(&self) -> &'static str {
        "memory"
    }
}

//! In-memory progress ledger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ProgressLedger, ProgressRecord};
use crate::error::{MigrateError, Result};

/// Ledger held in process memory. Keeps every saved value for inspection.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<String, ProgressRecord>>,
    history: Mutex<Vec<ProgressRecord>>,
    unavailable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `LedgerUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every record passed to `save`, in call order.
    pub fn history(&self) -> Vec<ProgressRecord> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MigrateError::LedgerUnavailable(
                "memory ledger marked unavailable".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressLedger for MemoryLedger {
    async fn save(&self, record: &ProgressRecord) -> Result<()> {
        self.check()?;
        let mut records = self
            .records
            .lock()
            .map_err(|_| MigrateError::LedgerUnavailable("lock poisoned".into()))?;
        records.insert(record.transfer_id.clone(), record.clone());
        if let Ok(mut history) = self.history.lock() {
            history.push(record.clone());
        }
        Ok(())
    }

    async fn load(&self, transfer_id: &str) -> Result<Option<ProgressRecord>> {
        self.check()?;
        let records = self
            .records
            .lock()
            .map_err(|_| MigrateError::LedgerUnavailable("lock poisoned".into()))?;
        Ok(records.get(transfer_id).cloned())
    }

    async fn clear(&self, transfer_id: &str) -> Result<()> {
        self.check()?;
        let mut records = self
            .records
            .lock()
            .map_err(|_| MigrateError::LedgerUnavailable("lock poisoned".into()))?;
        records.remove(transfer_id);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_and_unavailable() {
        let ledger = MemoryLedger::new();
        ledger.save(&ProgressRecord::new("t", "r1")).await.unwrap();
        ledger.save(&ProgressRecord::new("t", "r2")).await.unwrap();

        assert_eq!(ledger.history().len(), 2);
        assert_eq!(ledger.load("t").await.unwrap().unwrap().run_id, "r2");

        ledger.set_unavailable(true);
        assert!(matches!(
            ledger.load("t").await,
            Err(MigrateError::LedgerUnavailable(_))
        ));
    }
}

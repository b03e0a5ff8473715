//! File-based progress ledger.
//!
//! Each transfer identity maps to `{dir}/{transfer_id}.progress.json`. Writes
//! go to a temp file that is renamed over the target, so a crash mid-save
//! leaves the previous checkpoint intact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{ProgressLedger, ProgressRecord};
use crate::error::{MigrateError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Ledger storing one signed JSON file per transfer.
pub struct FileLedger {
    dir: PathBuf,
}

impl FileLedger {
    /// Create a ledger rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the checkpoint file for `transfer_id`.
    pub fn path_for(&self, transfer_id: &str) -> PathBuf {
        let safe: String = transfer_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.progress.json", safe))
    }

    /// Sign the record with its transfer identity as key.
    fn compute_hmac(record: &ProgressRecord) -> Result<String> {
        let mut unsigned = record.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned).map_err(|e| {
            MigrateError::LedgerUnavailable(format!("Failed to serialize checkpoint: {}", e))
        })?;

        let mut mac = HmacSha256::new_from_slice(record.transfer_id.as_bytes())
            .map_err(|e| MigrateError::LedgerUnavailable(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn unavailable(path: &Path, e: impl std::fmt::Display) -> MigrateError {
        MigrateError::LedgerUnavailable(format!("{}: {}", path.display(), e))
    }
}

#[async_trait]
impl ProgressLedger for FileLedger {
    async fn save(&self, record: &ProgressRecord) -> Result<()> {
        let path = self.path_for(&record.transfer_id);

        let mut signed = record.clone();
        signed.hmac = Some(Self::compute_hmac(record)?);
        let content = serde_json::to_string_pretty(&signed)
            .map_err(|e| Self::unavailable(&path, e))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::unavailable(&self.dir, e))?;

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| Self::unavailable(&temp_path, e))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| Self::unavailable(&path, e))?;

        debug!(
            "checkpoint saved: batch {} at {}",
            record.batch_seq, record.position
        );
        Ok(())
    }

    async fn load(&self, transfer_id: &str) -> Result<Option<ProgressRecord>> {
        let path = self.path_for(transfer_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::unavailable(&path, e)),
        };

        let record: ProgressRecord =
            serde_json::from_str(&content).map_err(|e| Self::unavailable(&path, e))?;

        if record.transfer_id != transfer_id {
            return Err(Self::unavailable(
                &path,
                format!("belongs to transfer '{}'", record.transfer_id),
            ));
        }

        match &record.hmac {
            Some(stored) => {
                if stored != &Self::compute_hmac(&record)? {
                    return Err(Self::unavailable(
                        &path,
                        "integrity check failed: HMAC mismatch (possible tampering)",
                    ));
                }
            }
            None => warn!(
                "{} has no HMAC signature, integrity cannot be verified",
                path.display()
            ),
        }

        Ok(Some(record))
    }

    async fn clear(&self, transfer_id: &str) -> Result<()> {
        let path = self.path_for(transfer_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::unavailable(&path, e)),
        }
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

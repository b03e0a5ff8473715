//! Configuration types with auto-tuning based on system resources.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::destination::ElasticsearchConfig;
use crate::transform::BinaryEncoding;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where records are read from.
    pub source: SourceConfig,

    /// Where documents are written to.
    pub destination: DestinationConfig,

    /// Checkpoint storage.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Batch outcome audit log.
    #[serde(default)]
    pub event_log: EventLogConfig,

    /// Transfer identity and pipeline tuning.
    pub transfer: TransferSettings,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.tuned_for(&resources)
    }

    /// Auto-tune against known resources.
    pub fn tuned_for(mut self, resources: &SystemResources) -> Self {
        if self.source.page_size.is_none() {
            // 500 records per page, doubled on hosts with 16 GB or more
            let page_size = if resources.total_memory_gb >= 16.0 { 1000 } else { 500 };
            self.source.page_size = Some(page_size);
        }
        self.transfer = self.transfer.with_auto_tuning(resources);

        info!(
            "Auto-tuned config: page_size={}, concurrency={}",
            self.source.get_page_size(),
            self.transfer.get_concurrency()
        );
        self
    }
}

/// Record source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source type. Only "jsonl" (an exported dataset, one record per line).
    #[serde(default = "default_jsonl")]
    pub r#type: String,

    /// Path of the exported dataset.
    pub path: PathBuf,

    /// Records per page (auto-tuned if not set).
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl SourceConfig {
    pub fn get_page_size(&self) -> usize {
        self.page_size.unwrap_or(500)
    }
}

/// Destination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Destination type. Only "elasticsearch".
    #[serde(default = "default_elasticsearch")]
    pub r#type: String,

    #[serde(flatten)]
    pub elasticsearch: ElasticsearchConfig,

    /// Text encoding per binary field, e.g. `{geo: utf8, iv: hex}`.
    #[serde(default)]
    pub binary_encodings: BTreeMap<String, BinaryEncoding>,

    /// Encoding for binary fields not listed in `binary_encodings`.
    #[serde(default)]
    pub default_binary_encoding: BinaryEncoding,
}

/// Progress ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Ledger type. Only "file".
    #[serde(default = "default_file")]
    pub r#type: String,

    /// Directory holding one checkpoint file per transfer.
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            r#type: default_file(),
            dir: default_state_dir(),
        }
    }
}

/// Event log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Event log type. Only "jsonl".
    #[serde(default = "default_jsonl")]
    pub r#type: String,

    /// Append-only outcome file.
    #[serde(default = "default_event_log_path")]
    pub path: PathBuf,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            r#type: default_jsonl(),
            path: default_event_log_path(),
        }
    }
}

/// Transfer identity and pipeline behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Transfer identity. Keys the checkpoint; keep it stable across runs.
    pub id: String,

    /// Batches written concurrently (auto-tuned if not set).
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Write attempts per batch (default: 3).
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Base retry delay in milliseconds (default: 100).
    #[serde(default)]
    pub retry_base_delay_ms: Option<u64>,

    /// Longest single retry delay in milliseconds (default: 5000).
    #[serde(default)]
    pub retry_max_delay_ms: Option<u64>,

    /// Total backoff allowed for one page fetch in seconds (default: 60).
    #[serde(default)]
    pub source_max_wait_secs: Option<u64>,

    /// Deadline for each store call in seconds (default: 30).
    #[serde(default)]
    pub store_timeout_secs: Option<u64>,

    /// Progress report interval in committed batches; 0 reports only at the end (default: 10).
    #[serde(default)]
    pub observe_every: Option<u64>,
}

impl TransferSettings {
    /// Fill unset performance fields from system resources.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.concurrency.is_none() {
            // Half the cores, between 4 and 8
            self.concurrency = Some((resources.cpu_cores / 2).clamp(4, 8));
        }
        self
    }

    pub fn get_concurrency(&self) -> usize {
        self.concurrency.unwrap_or(4)
    }

    pub fn get_max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(3)
    }

    pub fn get_retry_base_delay_ms(&self) -> u64 {
        self.retry_base_delay_ms.unwrap_or(100)
    }

    pub fn get_retry_max_delay_ms(&self) -> u64 {
        self.retry_max_delay_ms.unwrap_or(5000)
    }

    pub fn get_source_max_wait_secs(&self) -> u64 {
        self.source_max_wait_secs.unwrap_or(60)
    }

    pub fn get_store_timeout_secs(&self) -> u64 {
        self.store_timeout_secs.unwrap_or(30)
    }

    pub fn get_observe_every(&self) -> u64 {
        self.observe_every.unwrap_or(10)
    }

    /// Worst-case seconds for one in-flight batch to finish after cancellation:
    /// every write attempt timing out, the backoff between attempts, then the
    /// ledger save and event log append.
    pub fn drain_timeout_secs(&self) -> u64 {
        let attempts = u64::from(self.get_max_attempts().max(1));
        let store = self.get_store_timeout_secs();
        let backoff = self.get_retry_max_delay_ms().div_ceil(1000);
        attempts * store + (attempts - 1) * backoff + 2 * store
    }
}

fn default_jsonl() -> String {
    "jsonl".to_string()
}

fn default_elasticsearch() -> String {
    "elasticsearch".to_string()
}

fn default_file() -> String {
    "file".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".bulk-migrate")
}

fn default_event_log_path() -> PathBuf {
    PathBuf::from(".bulk-migrate/outcomes.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(cores: usize, ram_gb: f64) -> SystemResources {
        SystemResources {
            total_memory_gb: ram_gb,
            cpu_cores: cores,
        }
    }

    fn settings() -> TransferSettings {
        TransferSettings {
            id: "things-to-es".into(),
            concurrency: None,
            max_attempts: None,
            retry_base_delay_ms: None,
            retry_max_delay_ms: None,
            source_max_wait_secs: None,
            store_timeout_secs: None,
            observe_every: None,
        }
    }

    #[test]
    fn test_concurrency_tuned_between_four_and_eight() {
        assert_eq!(settings().with_auto_tuning(&resources(2, 4.0)).get_concurrency(), 4);
        assert_eq!(settings().with_auto_tuning(&resources(12, 4.0)).get_concurrency(), 6);
        assert_eq!(settings().with_auto_tuning(&resources(64, 4.0)).get_concurrency(), 8);
    }

    #[test]
    fn test_explicit_values_survive_tuning() {
        let mut s = settings();
        s.concurrency = Some(16);
        assert_eq!(s.with_auto_tuning(&resources(2, 4.0)).get_concurrency(), 16);
    }

    #[test]
    fn test_unset_fields_use_defaults() {
        let s = settings();
        assert_eq!(s.get_concurrency(), 4);
        assert_eq!(s.get_max_attempts(), 3);
        assert_eq!(s.get_retry_base_delay_ms(), 100);
        assert_eq!(s.get_retry_max_delay_ms(), 5000);
        assert_eq!(s.get_source_max_wait_secs(), 60);
        assert_eq!(s.get_store_timeout_secs(), 30);
        assert_eq!(s.get_observe_every(), 10);
    }

    #[test]
    fn test_drain_timeout_covers_every_write_attempt() {
        let s = settings();
        assert_eq!(s.drain_timeout_secs(), 3 * 30 + 2 * 5 + 2 * 30);

        let mut s = settings();
        s.max_attempts = Some(1);
        s.store_timeout_secs = Some(10);
        s.retry_max_delay_ms = Some(1500);
        assert_eq!(s.drain_timeout_secs(), 10 + 2 * 10);
    }
}

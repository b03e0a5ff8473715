//! Configuration loading, validation and store construction.

mod types;
mod validation;

pub use types::*;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::destination::{BulkWriter, ElasticsearchWriter};
use crate::error::Result;
use crate::eventlog::{EventLog, JsonLinesEventLog};
use crate::ledger::{FileLedger, ProgressLedger};
use crate::orchestrator::TransferConfig;
use crate::source::{JsonLinesSource, SourceCursor};
use crate::transform::DocTransformer;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of the configuration, logged at startup so runs can be matched
    /// to the settings they used.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Orchestrator settings, with defaults for anything left unset.
    pub fn transfer_config(&self) -> TransferConfig {
        let t = &self.transfer;
        TransferConfig::new(t.id.clone())
            .with_concurrency(t.get_concurrency())
            .with_max_attempts(t.get_max_attempts())
            .with_retry_delays(
                Duration::from_millis(t.get_retry_base_delay_ms()),
                Duration::from_millis(t.get_retry_max_delay_ms()),
            )
            .with_source_max_wait(Duration::from_secs(t.get_source_max_wait_secs()))
            .with_store_timeout(Duration::from_secs(t.get_store_timeout_secs()))
            .with_observe_every(t.get_observe_every())
    }

    /// Document transformer for the configured binary encodings.
    pub fn transformer(&self) -> DocTransformer {
        DocTransformer::new()
            .with_default_encoding(self.destination.default_binary_encoding)
            .with_binary_fields(&self.destination.binary_encodings)
    }
}

impl SourceConfig {
    pub fn build(&self) -> Arc<dyn SourceCursor> {
        Arc::new(JsonLinesSource::new(self.path.clone(), self.get_page_size()))
    }
}

impl DestinationConfig {
    pub fn build(&self) -> Result<Arc<dyn BulkWriter>> {
        Ok(Arc::new(ElasticsearchWriter::new(self.elasticsearch.clone())?))
    }
}

impl LedgerConfig {
    pub fn build(&self) -> Arc<dyn ProgressLedger> {
        Arc::new(FileLedger::new(self.dir.clone()))
    }
}

impl EventLogConfig {
    pub fn build(&self) -> Arc<dyn EventLog> {
        Arc::new(JsonLinesEventLog::new(self.path.clone()))
    }
}

//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.r#type != "jsonl" {
        return Err(MigrateError::Config(format!(
            "source.type must be 'jsonl', got '{}'",
            config.source.r#type
        )));
    }
    if config.source.path.as_os_str().is_empty() {
        return Err(MigrateError::Config("source.path is required".into()));
    }
    if let Some(0) = config.source.page_size {
        return Err(MigrateError::Config(
            "source.page_size must be at least 1".into(),
        ));
    }

    // Destination validation
    let dest = &config.destination;
    if dest.r#type != "elasticsearch" {
        return Err(MigrateError::Config(format!(
            "destination.type must be 'elasticsearch', got '{}'",
            dest.r#type
        )));
    }
    let es = &dest.elasticsearch;
    if !(es.url.starts_with("http://") || es.url.starts_with("https://")) {
        return Err(MigrateError::Config(format!(
            "destination.url must start with http:// or https://, got '{}'",
            es.url
        )));
    }
    if es.index.is_empty() {
        return Err(MigrateError::Config("destination.index is required".into()));
    }
    if es.index.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(MigrateError::Config(format!(
            "destination.index must be lowercase, got '{}'",
            es.index
        )));
    }
    if es.password.is_some() && es.username.is_none() {
        return Err(MigrateError::Config(
            "destination.password requires destination.username".into(),
        ));
    }

    // Stores
    if config.ledger.r#type != "file" {
        return Err(MigrateError::Config(format!(
            "ledger.type must be 'file', got '{}'",
            config.ledger.r#type
        )));
    }
    if config.ledger.dir.as_os_str().is_empty() {
        return Err(MigrateError::Config("ledger.dir is required".into()));
    }
    if config.event_log.r#type != "jsonl" {
        return Err(MigrateError::Config(format!(
            "event_log.type must be 'jsonl', got '{}'",
            config.event_log.r#type
        )));
    }
    if config.event_log.path.as_os_str().is_empty() {
        return Err(MigrateError::Config("event_log.path is required".into()));
    }

    // Transfer validation - only check tuning values if explicitly set
    let transfer = &config.transfer;
    if transfer.id.trim().is_empty() {
        return Err(MigrateError::Config("transfer.id is required".into()));
    }
    if let Some(0) = transfer.concurrency {
        return Err(MigrateError::Config(
            "transfer.concurrency must be at least 1".into(),
        ));
    }
    if let Some(0) = transfer.max_attempts {
        return Err(MigrateError::Config(
            "transfer.max_attempts must be at least 1".into(),
        ));
    }
    if let Some(0) = transfer.store_timeout_secs {
        return Err(MigrateError::Config(
            "transfer.store_timeout_secs must be at least 1".into(),
        ));
    }
    if transfer.get_retry_max_delay_ms() < transfer.get_retry_base_delay_ms() {
        return Err(MigrateError::Config(
            "transfer.retry_max_delay_ms must not be below retry_base_delay_ms".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DestinationConfig, EventLogConfig, LedgerConfig, SourceConfig, TransferSettings,
    };
    use crate::destination::ElasticsearchConfig;
    use std::collections::BTreeMap;

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                r#type: "jsonl".to_string(),
                path: "export.jsonl".into(),
                page_size: Some(500),
            },
            destination: DestinationConfig {
                r#type: "elasticsearch".to_string(),
                elasticsearch: ElasticsearchConfig {
                    url: "http://localhost:9200".to_string(),
                    index: "things".to_string(),
                    username: Some("elastic".to_string()),
                    password: Some("secret_password".to_string()),
                    request_timeout_secs: 30,
                },
                binary_encodings: BTreeMap::new(),
                default_binary_encoding: Default::default(),
            },
            ledger: LedgerConfig::default(),
            event_log: EventLogConfig::default(),
            transfer: TransferSettings {
                id: "things-to-es".to_string(),
                concurrency: None,
                max_attempts: None,
                retry_base_delay_ms: None,
                retry_max_delay_ms: None,
                source_max_wait_secs: None,
                store_timeout_secs: None,
                observe_every: None,
            },
        }
    }

    fn config_error(config: &Config) -> String {
        match validate(config) {
            Err(MigrateError::Config(msg)) => msg,
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_transfer_id() {
        let mut config = valid_config();
        config.transfer.id = "  ".to_string();
        assert!(config_error(&config).contains("transfer.id"));
    }

    #[test]
    fn test_unknown_store_types() {
        let mut config = valid_config();
        config.source.r#type = "cassandra".to_string();
        assert!(config_error(&config).contains("source.type"));

        let mut config = valid_config();
        config.ledger.r#type = "redis".to_string();
        assert!(config_error(&config).contains("ledger.type"));

        let mut config = valid_config();
        config.event_log.r#type = "mongo".to_string();
        assert!(config_error(&config).contains("event_log.type"));
    }

    #[test]
    fn test_destination_rules() {
        let mut config = valid_config();
        config.destination.elasticsearch.url = "localhost:9200".to_string();
        assert!(config_error(&config).contains("destination.url"));

        let mut config = valid_config();
        config.destination.elasticsearch.index = "Things".to_string();
        assert!(config_error(&config).contains("lowercase"));

        let mut config = valid_config();
        config.destination.elasticsearch.username = None;
        assert!(config_error(&config).contains("username"));
    }

    #[test]
    fn test_zero_tuning_values_rejected() {
        let mut config = valid_config();
        config.transfer.concurrency = Some(0);
        assert!(config_error(&config).contains("concurrency"));

        let mut config = valid_config();
        config.transfer.max_attempts = Some(0);
        assert!(config_error(&config).contains("max_attempts"));

        let mut config = valid_config();
        config.source.page_size = Some(0);
        assert!(config_error(&config).contains("page_size"));
    }

    #[test]
    fn test_retry_delay_order() {
        let mut config = valid_config();
        config.transfer.retry_base_delay_ms = Some(2000);
        config.transfer.retry_max_delay_ms = Some(1000);
        assert!(config_error(&config).contains("retry_max_delay_ms"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let debug = format!("{:?}", valid_config());
        assert!(!debug.contains("secret_password"));
        assert!(debug.contains("[REDACTED]"));
    }
}

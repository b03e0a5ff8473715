//! Error types for the transfer engine.

use thiserror::Error;

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code when a batch exhausted its retry budget.
pub const EXIT_BATCH_FAILED: u8 = 2;
/// Exit code when the source could not be read (including stale tokens).
pub const EXIT_SOURCE_ERROR: u8 = 3;
/// Exit code when the progress ledger or event log is unavailable.
pub const EXIT_CHECKPOINT_ERROR: u8 = 4;
/// Exit code for transform defects.
pub const EXIT_TRANSFORM_ERROR: u8 = 5;
/// Exit code for destination errors outside the batch retry loop.
pub const EXIT_DESTINATION_ERROR: u8 = 6;
/// Exit code for local I/O errors.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code when the run was cancelled by a signal.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for transfer operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient source failure. The token passed in stays valid for retry.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The continuation token no longer matches the source data.
    #[error("Continuation token is stale: {0}. Run `reset` to start a full re-scan.")]
    StaleToken(String),

    /// A record could not be mapped to a destination document.
    #[error("Transform failed for record {record}: {message}")]
    Transform { record: String, message: String },

    /// The destination rejected or failed a bulk write.
    #[error("Destination write failed: {0}")]
    DestinationWrite(String),

    /// The progress ledger could not be read or written.
    #[error("Progress ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// The event log could not be appended to or queried.
    #[error("Event log unavailable: {0}")]
    LogUnavailable(String),

    /// HTTP transport error talking to the destination.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transfer was cancelled (SIGINT, etc.)
    #[error("Transfer cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Transform error for the given record id.
    pub fn transform(record: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transform {
            record: record.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call can succeed.
    ///
    /// Timeouts are reported as `SourceUnavailable` or `DestinationWrite` and
    /// are retryable like any other transient failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MigrateError::SourceUnavailable(_)
                | MigrateError::DestinationWrite(_)
                | MigrateError::Http(_)
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::SourceUnavailable(_) | MigrateError::StaleToken(_) => EXIT_SOURCE_ERROR,
            MigrateError::Transform { .. } => EXIT_TRANSFORM_ERROR,
            MigrateError::DestinationWrite(_) | MigrateError::Http(_) => EXIT_DESTINATION_ERROR,
            MigrateError::LedgerUnavailable(_) | MigrateError::LogUnavailable(_) => {
                EXIT_CHECKPOINT_ERROR
            }
            MigrateError::Io(_) | MigrateError::Json(_) => EXIT_IO_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

//! Timeouts and bounded retry for store calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::core::{ContinuationToken, Page};
use crate::error::{MigrateError, Result};
use crate::source::SourceCursor;

use super::TransferConfig;

/// Run `fut` with a deadline. An elapsed deadline becomes `on_timeout(message)`,
/// which callers pick to be the transient error of the store being called.
pub(crate) async fn with_timeout<T, F>(
    limit: Duration,
    what: &str,
    on_timeout: fn(String) -> MigrateError,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(format!("{} timed out after {:?}", what, limit))),
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
pub(crate) fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(max)
}

/// Fetch a page, retrying transient failures until the cumulative backoff
/// would exceed `source_max_wait`. Returns the attempt count with the result.
pub(crate) async fn fetch_with_retry(
    source: &dyn SourceCursor,
    token: Option<&ContinuationToken>,
    config: &TransferConfig,
) -> (Result<Page>, u32) {
    let mut waited = Duration::ZERO;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = with_timeout(
            config.store_timeout,
            "page fetch",
            MigrateError::SourceUnavailable,
            source.fetch_page(token),
        )
        .await;

        match result {
            Err(e) if e.is_transient() => {
                let delay = backoff_delay(config.retry_base_delay, config.retry_max_delay, attempt);
                if waited + delay > config.source_max_wait {
                    return (Err(e), attempt);
                }
                warn!(
                    "{} fetch failed (attempt {}), retrying in {:?}: {}",
                    source.source_type(),
                    attempt,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                waited += delay;
            }
            other => return (other, attempt),
        }
    }
}

//! Paginated source cursors.
//!
//! A [`SourceCursor`] is stateless across calls: all position state lives in
//! the [`ContinuationToken`] it hands back, so a failed fetch can be retried
//! with the same token and a crashed run can resume from a stored one.
//!
//! Implementations:
//!
//! - [`MemorySource`]: keyset pagination over an in-memory record set
//! - [`JsonLinesSource`]: byte-offset pagination over an exported JSON-lines file

mod jsonl;
mod memory;

pub use jsonl::JsonLinesSource;
pub use memory::MemorySource;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::{ContinuationToken, Page};
use crate::error::{MigrateError, Result};

/// Paginated retrieval from the source store.
///
/// # Contract
///
/// - `token` is either `None` (start of scan) or a token previously returned
///   by the same source.
/// - The returned page holds at most [`SourceCursor::page_size`] records.
/// - `next_token = None` signals exhaustion; the caller must stop.
/// - Transient I/O failures return [`MigrateError::SourceUnavailable`] and the
///   token passed in remains valid for retry.
/// - A token that no longer matches the underlying data returns
///   [`MigrateError::StaleToken`]; only a full re-scan recovers from that.
#[async_trait]
pub trait SourceCursor: Send + Sync {
    /// Fetch the page that starts strictly after `token`.
    async fn fetch_page(&self, token: Option<&ContinuationToken>) -> Result<Page>;

    /// Maximum number of records per page.
    fn page_size(&self) -> usize;

    /// Get the source type name for logging/debugging.
    fn source_type(&self) -> &'static str;
}

/// Encode a source position as an opaque URL-safe token.
pub(crate) fn encode_token<T: Serialize>(position: &T) -> Result<ContinuationToken> {
    let json = serde_json::to_vec(position)?;
    Ok(ContinuationToken::new(URL_SAFE_NO_PAD.encode(json)))
}

/// Decode a token produced by [`encode_token`].
///
/// Anything that does not decode is treated as stale: it was not issued by
/// this source, or the format has changed since it was stored.
pub(crate) fn decode_token<T: DeserializeOwned>(token: &ContinuationToken) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.as_str())
        .map_err(|e| MigrateError::StaleToken(format!("undecodable token: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| MigrateError::StaleToken(format!("unrecognized token: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pos {
        offset: u64,
    }

    #[test]
    fn test_token_roundtrip() {
        let token = encode_token(&Pos { offset: 42 }).unwrap();
        assert!(!token.as_str().contains('='));
        let pos: Pos = decode_token(&token).unwrap();
        assert_eq!(pos, Pos { offset: 42 });
    }

    #[test]
    fn test_foreign_token_is_stale() {
        let err = decode_token::<Pos>(&ContinuationToken::new("not a token!")).unwrap_err();
        assert!(matches!(err, MigrateError::StaleToken(_)));
    }
}

//! Continuation tokens, pages and scan positions.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::record::Record;

/// Opaque cursor marking a resumable position in the source scan.
///
/// Only the source that issued a token interprets it; everyone else stores
/// and returns it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    /// Wrap a source-encoded token.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Raw token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens can be long; logs only need enough to correlate.
        if self.0.chars().count() > 24 {
            let prefix: String = self.0.chars().take(24).collect();
            write!(f, "{}…", prefix)
        } else {
            f.write_str(&self.0)
        }
    }
}

/// An ordered batch of records plus the token for the next page.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records in source scan order.
    pub records: Vec<Record>,

    /// Token for the next page; `None` means the scan is exhausted.
    pub next_token: Option<ContinuationToken>,
}

impl Page {
    /// Whether this is the last page of the scan.
    pub fn is_last(&self) -> bool {
        self.next_token.is_none()
    }

    /// Number of records in the page.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the page holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Checkpointed position in the source scan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "token", rename_all = "snake_case")]
pub enum ScanPosition {
    /// Nothing committed yet; scan from the beginning.
    #[default]
    Start,

    /// Everything before this token has been durably written.
    After(ContinuationToken),

    /// End-of-stream marker: the whole source has been written.
    Exhausted,
}

impl ScanPosition {
    /// Token to present to the source to continue from this position.
    ///
    /// Returns `None` for both `Start` and `Exhausted`; callers must check
    /// [`ScanPosition::is_exhausted`] before fetching.
    pub fn token(&self) -> Option<&ContinuationToken> {
        match self {
            ScanPosition::After(token) => Some(token),
            _ => None,
        }
    }

    /// Position reached after committing a page that returned `next`.
    pub fn after_page(next: Option<ContinuationToken>) -> Self {
        match next {
            Some(token) => ScanPosition::After(token),
            None => ScanPosition::Exhausted,
        }
    }

    /// Whether the scan is complete.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ScanPosition::Exhausted)
    }
}

impl fmt::Display for ScanPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanPosition::Start => f.write_str("start"),
            ScanPosition::After(token) => write!(f, "after {}", token),
            ScanPosition::Exhausted => f.write_str("end-of-stream"),
        }
    }
}

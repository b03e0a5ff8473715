//! JSON-lines export source.
//!
//! Each non-empty line is one serialized [`Record`]. The token records the byte
//! offset just past the last emitted line together with a digest of that line.
//! On resume the line is read back and checked; if the file was rewritten
//! between runs the token is stale and the transfer must be reset.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::debug;

use super::{decode_token, encode_token, SourceCursor};
use crate::core::{ContinuationToken, Page, Record};
use crate::error::{MigrateError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct LinePosition {
    /// Byte offset where the next page starts.
    offset: u64,
    /// Byte offset where the last emitted line starts.
    line_start: u64,
    /// 1-based line number of the last emitted line.
    line: u64,
    /// SHA-256 of the last emitted line's bytes, hex encoded.
    digest: String,
}

/// Source reading an exported JSON-lines file.
pub struct JsonLinesSource {
    path: PathBuf,
    page_size: usize,
}

impl JsonLinesSource {
    /// Create a source over the file at `path`.
    pub fn new(path: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            path: path.into(),
            page_size: page_size.max(1),
        }
    }

    /// Path of the export file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> Result<(File, u64)> {
        let file = File::open(&self.path).await.map_err(|e| {
            MigrateError::SourceUnavailable(format!("cannot open {:?}: {}", self.path, e))
        })?;
        let len = file
            .metadata()
            .await
            .map_err(|e| MigrateError::SourceUnavailable(e.to_string()))?
            .len();
        Ok((file, len))
    }

    /// Check that the line the token points behind is still the same line.
    async fn verify_position(&self, file: &mut File, len: u64, pos: &LinePosition) -> Result<()> {
        if pos.offset > len || pos.line_start >= pos.offset {
            return Err(MigrateError::StaleToken(format!(
                "offset {} is beyond the end of {:?} ({} bytes)",
                pos.offset, self.path, len
            )));
        }

        file.seek(SeekFrom::Start(pos.line_start))
            .await
            .map_err(|e| MigrateError::SourceUnavailable(e.to_string()))?;
        let mut line = vec![0u8; (pos.offset - pos.line_start) as usize];
        file.read_exact(&mut line)
            .await
            .map_err(|e| MigrateError::SourceUnavailable(e.to_string()))?;

        if hex::encode(Sha256::digest(&line)) != pos.digest {
            return Err(MigrateError::StaleToken(format!(
                "line {} of {:?} changed since the token was issued",
                pos.line, self.path
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceCursor for JsonLinesSource {
    async fn fetch_page(&self, token: Option<&ContinuationToken>) -> Result<Page> {
        let (mut file, len) = self.open().await?;

        let (mut offset, mut line_no) = match token {
            Some(token) => {
                let pos: LinePosition = decode_token(token)?;
                self.verify_position(&mut file, len, &pos).await?;
                (pos.offset, pos.line)
            }
            None => (0, 0),
        };

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| MigrateError::SourceUnavailable(e.to_string()))?;
        let mut reader = BufReader::new(file);

        let mut records = Vec::with_capacity(self.page_size);
        let mut last: Option<LinePosition> = None;
        let mut buf = Vec::new();

        while records.len() < self.page_size {
            buf.clear();
            let line_start = offset;
            let n = reader
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|e| MigrateError::SourceUnavailable(e.to_string()))?;
            if n == 0 {
                break;
            }
            offset += n as u64;
            line_no += 1;

            let text = std::str::from_utf8(&buf).map_err(|e| {
                MigrateError::transform(
                    format!("{}:{}", self.path.display(), line_no),
                    format!("line is not valid UTF-8: {}", e),
                )
            })?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            let record: Record = serde_json::from_str(text).map_err(|e| {
                MigrateError::transform(
                    format!("{}:{}", self.path.display(), line_no),
                    format!("malformed record: {}", e),
                )
            })?;
            records.push(record);
            last = Some(LinePosition {
                offset,
                line_start,
                line: line_no,
                digest: hex::encode(Sha256::digest(&buf)),
            });
        }

        let next_token = match last {
            Some(pos) if pos.offset < len => Some(encode_token(&pos)?),
            _ => None,
        };

        debug!(
            "{:?}: read {} records up to line {} (offset {}/{})",
            self.path,
            records.len(),
            line_no,
            offset,
            len
        );

        Ok(Page {
            records,
            next_token,
        })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn source_type(&self) -> &'static str {
        "jsonl"
    }
}

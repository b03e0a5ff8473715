//! JSON-lines event log file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;

use super::{BatchOutcome, EventLog, OutcomeFilter};
use crate::error::{MigrateError, Result};

/// Event log appending one JSON object per line to a file.
pub struct JsonLinesEventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

enum ReadState {
    Unopened(PathBuf),
    Reading(Lines<BufReader<File>>, u64),
}

impl JsonLinesEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(path: &Path, e: impl std::fmt::Display) -> MigrateError {
        MigrateError::LogUnavailable(format!("{}: {}", path.display(), e))
    }

    /// Read the next entry, opening the file on first use.
    async fn next_entry(state: ReadState) -> Result<Option<(BatchOutcome, ReadState)>> {
        let (mut lines, mut line_no) = match state {
            ReadState::Unopened(path) => match File::open(&path).await {
                Ok(file) => (BufReader::new(file).lines(), 0),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(Self::unavailable(&path, e)),
            },
            ReadState::Reading(lines, line_no) => (lines, line_no),
        };

        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| MigrateError::LogUnavailable(e.to_string()))?;
            let Some(line) = line else {
                return Ok(None);
            };
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let outcome: BatchOutcome = serde_json::from_str(&line).map_err(|e| {
                MigrateError::LogUnavailable(format!("corrupt entry on line {}: {}", line_no, e))
            })?;
            return Ok(Some((outcome, ReadState::Reading(lines, line_no))));
        }
    }
}

#[async_trait]
impl EventLog for JsonLinesEventLog {
    async fn append(&self, outcome: &BatchOutcome) -> Result<()> {
        let mut line = serde_json::to_string(outcome)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::unavailable(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Self::unavailable(&self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Self::unavailable(&self.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| Self::unavailable(&self.path, e))?;
        Ok(())
    }

    fn query(&self, filter: OutcomeFilter) -> BoxStream<'_, Result<BatchOutcome>> {
        stream::try_unfold(ReadState::Unopened(self.path.clone()), Self::next_entry)
            .try_filter(move |outcome| futures::future::ready(filter.matches(outcome)))
            .boxed()
    }

    fn backend_type(&self) -> &'static str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::{sample_outcome, OutcomeKind};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_query() {
        let dir = TempDir::new().unwrap();
        let log = JsonLinesEventLog::new(dir.path().join("logs/outcomes.jsonl"));

        log.append(&sample_outcome("r1", 1, OutcomeKind::Success)).await.unwrap();
        log.append(&sample_outcome("r1", 2, OutcomeKind::Failure)).await.unwrap();
        log.append(&sample_outcome("r2", 2, OutcomeKind::Success)).await.unwrap();

        let all: Vec<_> = log.query(OutcomeFilter::all()).try_collect().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].batch_seq, 1);

        let failures: Vec<_> = log
            .query(OutcomeFilter::failures())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.as_deref(), Some("bulk request returned 503"));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = JsonLinesEventLog::new(dir.path().join("none.jsonl"));
        let entries: Vec<_> = log.query(OutcomeFilter::all()).try_collect().await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_query_is_lazy_and_restartable() {
        let dir = TempDir::new().unwrap();
        let log = JsonLinesEventLog::new(dir.path().join("outcomes.jsonl"));
        for seq in 1..=5 {
            log.append(&sample_outcome("r1", seq, OutcomeKind::Success)).await.unwrap();
        }

        let first_two: Vec<_> = log
            .query(OutcomeFilter::all())
            .take(2)
            .try_collect()
            .await
            .unwrap();
        let last_seen = first_two.last().unwrap().batch_seq;

        let rest: Vec<_> = log
            .query(OutcomeFilter::all().since(last_seen + 1))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rest.iter().map(|o| o.batch_seq).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_log_unavailable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outcomes.jsonl");
        std::fs::write(&path, "{broken\n").unwrap();

        let log = JsonLinesEventLog::new(&path);
        let result: Result<Vec<_>> = log.query(OutcomeFilter::all()).try_collect().await;
        assert!(matches!(result, Err(MigrateError::LogUnavailable(_))));
    }
}

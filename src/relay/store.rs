//! Append-only proposal store backing the relay server
//!
//! The store is a flat text file, one `base64,hex` record per line. Records
//! are never rewritten, deduplicated or expired. A batch is validated as a
//! whole before anything is written: one malformed line rejects the batch.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::network::serialization::{RecordFormatError, RelayRecord};

/// Why a POSTed batch was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchRejection {
    #[error("request body is not valid UTF-8")]
    NotUtf8,

    #[error("line {line}: {reason}")]
    Malformed {
        line: usize,
        reason: RecordFormatError,
    },
}

/// Result of submitting a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    /// Number of records appended
    Accepted(usize),
    Rejected(BatchRejection),
}

/// Flat-file relay store
///
/// Appends hold the write lock for the whole batch, reads hold the read
/// lock, so a GET never sees half of a batch.
pub struct RelayStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl RelayStore {
    /// Open (or create) the store file at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
        }

        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open proposal store: {}", path.display()))?;

        let mut contents = tokio::fs::read(&path).await?;
        if !contents.is_empty() && !contents.ends_with(b"\n") {
            // A torn tail was never acknowledged to a client
            let keep = contents
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |i| i + 1);
            tracing::warn!(
                "⚠️  Proposal store {} ends with a torn record; dropping {} trailing byte(s)",
                path.display(),
                contents.len() - keep
            );

            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .with_context(|| format!("Failed to open proposal store: {}", path.display()))?;
            file.set_len(keep as u64)
                .await
                .with_context(|| format!("Failed to repair proposal store: {}", path.display()))?;
            file.sync_data().await?;
            contents.truncate(keep);
        }

        tracing::info!(
            "📦 Opened proposal store {} ({} records)",
            path.display(),
            count_lines(&contents)
        );

        Ok(Self {
            path,
            lock: RwLock::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entire store contents: every record followed by a newline, in insertion order
    pub async fn get_all(&self) -> Result<Vec<u8>> {
        let _guard = self.lock.read().await;
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read proposal store: {}", self.path.display()))
    }

    /// Number of stored records
    pub async fn record_count(&self) -> Result<usize> {
        Ok(count_lines(&self.get_all().await?))
    }

    /// Validate and append a newline-separated batch of records
    ///
    /// All-or-nothing: a single malformed line means nothing is appended.
    /// I/O failures are returned as errors; a refused batch is an `Ok`.
    pub async fn post(&self, batch: &[u8]) -> Result<PostOutcome> {
        let lines = match validate_batch(batch) {
            Ok(lines) => lines,
            Err(rejection) => {
                tracing::warn!("This proposal batch was not accepted: {}", rejection);
                return Ok(PostOutcome::Rejected(rejection));
            }
        };

        if lines.is_empty() {
            return Ok(PostOutcome::Accepted(0));
        }

        let mut buffer = String::with_capacity(batch.len() + lines.len());
        for line in &lines {
            buffer.push_str(line);
            buffer.push('\n');
        }

        let _guard = self.lock.write().await;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open proposal store: {}", self.path.display()))?;
        file.write_all(buffer.as_bytes()).await?;
        file.sync_data().await?;

        tracing::info!("📥 Stored {} proposal(s)", lines.len());
        Ok(PostOutcome::Accepted(lines.len()))
    }
}

/// Check every non-empty line of a batch
///
/// # Returns
/// The lines to store (trailing `\r` removed), or the first problem found
pub fn validate_batch(batch: &[u8]) -> Result<Vec<&str>, BatchRejection> {
    let text = std::str::from_utf8(batch).map_err(|_| BatchRejection::NotUtf8)?;

    let mut lines = Vec::new();
    for (index, raw_line) in text.split('\n').enumerate() {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        line.parse::<RelayRecord>()
            .map_err(|reason| BatchRejection::Malformed {
                line: index + 1,
                reason,
            })?;
        lines.push(line);
    }

    tracing::debug!("Client sent proposal batch of {} record(s)", lines.len());
    Ok(lines)
}

fn count_lines(contents: &[u8]) -> usize {
    contents.iter().filter(|&&b| b == b'\n').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use base64::{engine::general_purpose::STANDARD, Engine as _};

    const PUBKEY_HEX: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    fn valid_line(tag: u8) -> String {
        let mut blob = vec![0x01];
        blob.extend_from_slice(&[tag; 48]);
        format!("{},{}", STANDARD.encode(blob), PUBKEY_HEX)
    }

    async fn open_temp() -> (tempfile::TempDir, RelayStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RelayStore::open(dir.path().join("snicker-proposals.txt"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_valid_batch_appended_in_order() {
        let (_dir, store) = open_temp().await;
        let batch = format!("{}\n{}\n{}", valid_line(1), valid_line(2), valid_line(3));

        let outcome = store.post(batch.as_bytes()).await.unwrap();
        assert_eq!(outcome, PostOutcome::Accepted(3));

        let contents = String::from_utf8(store.get_all().await.unwrap()).unwrap();
        assert_eq!(
            contents,
            format!("{}\n{}\n{}\n", valid_line(1), valid_line(2), valid_line(3))
        );
    }

    #[tokio::test]
    async fn test_malformed_line_rejects_whole_batch() {
        let (_dir, store) = open_temp().await;
        store.post(valid_line(9).as_bytes()).await.unwrap();

        let batch = format!("{}\n{}\nnot-a-record\n", valid_line(1), valid_line(2));
        let outcome = store.post(batch.as_bytes()).await.unwrap();

        assert!(matches!(
            outcome,
            PostOutcome::Rejected(BatchRejection::Malformed { line: 3, .. })
        ));
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_short_payload_rejected() {
        let (_dir, store) = open_temp().await;

        let outcome = store.post(b"YmFk,0011").await.unwrap();

        assert!(matches!(outcome, PostOutcome::Rejected(_)));
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_lines_and_crlf() {
        let (_dir, store) = open_temp().await;
        let batch = format!("\n{}\r\n\n\n{}\n", valid_line(1), valid_line(2));

        let outcome = store.post(batch.as_bytes()).await.unwrap();
        assert_eq!(outcome, PostOutcome::Accepted(2));

        let contents = String::from_utf8(store.get_all().await.unwrap()).unwrap();
        assert_eq!(contents, format!("{}\n{}\n", valid_line(1), valid_line(2)));
    }

    #[tokio::test]
    async fn test_non_utf8_rejected() {
        let (_dir, store) = open_temp().await;

        let outcome = store.post(&[0xff, 0xfe, b'\n']).await.unwrap();
        assert_eq!(outcome, PostOutcome::Rejected(BatchRejection::NotUtf8));
    }

    #[tokio::test]
    async fn test_duplicates_are_kept() {
        let (_dir, store) = open_temp().await;

        store.post(valid_line(5).as_bytes()).await.unwrap();
        store.post(valid_line(5).as_bytes()).await.unwrap();

        assert_eq!(store.record_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_after_several_batches() {
        let (_dir, store) = open_temp().await;
        let mut expected = String::new();

        for k in 0..4u8 {
            let batch = format!("{}\n{}\n", valid_line(k * 2), valid_line(k * 2 + 1));
            store.post(batch.as_bytes()).await.unwrap();
            expected.push_str(&batch);
        }

        assert_eq!(store.get_all().await.unwrap(), expected.into_bytes());
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.txt");

        let store = RelayStore::open(&path).await.unwrap();
        store.post(valid_line(1).as_bytes()).await.unwrap();
        drop(store);

        let reopened = RelayStore::open(&path).await.unwrap();
        assert_eq!(reopened.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_torn_tail_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snicker-proposals.txt");
        std::fs::write(&path, format!("{}\nAQIDBAUGBw,02c6", valid_line(1))).unwrap();

        let store = RelayStore::open(&path).await.unwrap();
        assert_eq!(store.record_count().await.unwrap(), 1);

        assert_eq!(
            store.post(valid_line(2).as_bytes()).await.unwrap(),
            PostOutcome::Accepted(1)
        );

        let contents = store.get_all().await.unwrap();
        let text = String::from_utf8(contents).unwrap();
        assert_eq!(text, format!("{}\n{}\n", valid_line(1), valid_line(2)));

        let (records, skipped) = crate::network::serialization::parse_records(&text);
        assert_eq!(records.len(), 2);
        assert_eq!(skipped, 0);
    }

    #[tokio::test]
    async fn test_torn_only_record_leaves_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snicker-proposals.txt");
        std::fs::write(&path, "AQIDBAUG").unwrap();

        let store = RelayStore::open(&path).await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_posts_do_not_interleave() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for task in 0..8u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let batch: String = (0..5u8)
                    .map(|i| format!("{}\n", valid_line(task * 10 + i)))
                    .collect();
                store.post(batch.as_bytes()).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), PostOutcome::Accepted(5));
        }

        let contents = String::from_utf8(store.get_all().await.unwrap()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 40);
        assert!(lines.iter().all(|l| l.parse::<RelayRecord>().is_ok()));
    }
}

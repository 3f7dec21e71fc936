//! Append-only, human-readable log of failed download attempts.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::downloader::{DownloadRequest, DownloadStatus};
use crate::error::{Result, ResultExt};

/// Failure log shared by all concurrent acquisitions.
///
/// Each entry is written as one block with a single `write_all` while the
/// internal lock is held, so entries never interleave.
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    lock: Mutex<()>,
}

/// One failed attempt, as written to the log.
#[derive(Debug, Clone, Copy)]
pub struct FailureEntry<'a> {
    pub backend: &'a str,
    pub request: &'a DownloadRequest,
    pub status: DownloadStatus,
    pub message: &'a str,
    pub retry_round: u32,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: FailureEntry<'_>) -> Result<()> {
        let block = format_entry(&entry);
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(format!("creating {:?}", parent))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(format!("opening error log {:?}", self.path))?;
        file.write_all(block.as_bytes())
            .await
            .with_context("appending to error log")?;
        file.flush().await.with_context("flushing error log")?;
        Ok(())
    }
}

fn format_entry(entry: &FailureEntry<'_>) -> String {
    let request = entry.request;
    let isrc = if request.isrc.is_empty() {
        "-"
    } else {
        request.isrc.as_str()
    };
    format!(
        "[{}] backend={} status={} round={}\n  track: {} - {}\n  album: {}\n  isrc: {}\n  message: {}\n\n",
        Utc::now().to_rfc3339(),
        entry.backend,
        entry.status,
        entry.retry_round + 1,
        request.artist,
        request.title,
        request.album,
        isrc,
        entry.message.trim(),
    )
}

/// Number of entries in a log written by [`ErrorLog`].
pub fn count_entries(text: &str) -> usize {
    text.lines().filter(|l| l.starts_with('[') && l.contains(" backend=")).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn request() -> DownloadRequest {
        DownloadRequest {
            artist: "Artist".into(),
            title: "Song".into(),
            album: "Album".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_append_writes_block() {
        let dir = TempDir::new().unwrap();
        let log = ErrorLog::new(dir.path().join("logs").join("errors.log"));
        let req = request();
        log.append(FailureEntry {
            backend: "qobuz",
            request: &req,
            status: DownloadStatus::Failed,
            message: "boom",
            retry_round: 0,
        })
        .await
        .unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.contains("backend=qobuz status=failed round=1"));
        assert!(text.contains("track: Artist - Song"));
        assert!(text.contains("isrc: -"));
        assert!(text.contains("message: boom"));
        assert_eq!(count_entries(&text), 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(ErrorLog::new(dir.path().join("errors.log")));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move {
                    let req = request();
                    let message = format!("failure {i}");
                    log.append(FailureEntry {
                        backend: "slskd",
                        request: &req,
                        status: DownloadStatus::Timeout,
                        message: &message,
                        retry_round: 1,
                    })
                    .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(count_entries(&text), 16);
        for block in text.split("\n\n").filter(|b| !b.trim().is_empty()) {
            assert_eq!(block.lines().count(), 5, "malformed block: {block}");
        }
    }
}

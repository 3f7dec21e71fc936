//! Downloader backends and the priority-ordered chain.
//!
//! A [`Downloader`] exposes `match_track` and `enqueue`. Expected outcomes
//! (nothing found, rate limited, timed out) are [`DownloadStatus`] values,
//! never errors. The [`DownloaderChain`] holds the backends sorted by
//! ascending priority and nothing else.

pub mod command;
pub mod local;
pub mod registry;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::matching::MatchResult;
use crate::model::Track;

pub use crate::model::DownloadStatus;

/// What to look for. Built from a [`Track`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadRequest {
    pub isrc: String,
    pub artist: String,
    pub title: String,
    pub album: String,
    /// 0 when unknown
    pub year: i32,
    pub album_url: String,
}

impl DownloadRequest {
    pub fn from_track(track: &Track) -> Self {
        Self {
            isrc: track.isrc.clone(),
            artist: track.artist.clone(),
            title: track.title.clone(),
            album: track.album.clone(),
            year: track.release_year,
            album_url: track.album_url.clone(),
        }
    }

    /// The request as a track, for scoring candidates.
    pub fn as_track(&self) -> Track {
        Track::new(&self.title, &self.artist, &self.album, &self.isrc).with_release_year(self.year)
    }

    /// Free-text query: `artist title`.
    pub fn query(&self) -> String {
        format!("{} {}", self.artist.trim(), self.title.trim())
            .trim()
            .to_string()
    }
}

/// Outcome of [`Downloader::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResult {
    pub status: DownloadStatus,
    /// Folder (or file) holding the download
    pub path: Option<PathBuf>,
    pub downloaded_files: Vec<PathBuf>,
    pub error_message: String,
    /// Match evidence established while downloading, if any
    pub match_result: Option<MatchResult>,
}

impl DownloadResult {
    pub fn success(path: impl Into<PathBuf>, downloaded_files: Vec<PathBuf>) -> Self {
        Self {
            status: DownloadStatus::Success,
            path: Some(path.into()),
            downloaded_files,
            error_message: String::new(),
            match_result: None,
        }
    }

    pub fn failure(status: DownloadStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            path: None,
            downloaded_files: Vec::new(),
            error_message: message.into(),
            match_result: None,
        }
    }

    pub fn with_match(mut self, result: MatchResult) -> Self {
        self.match_result = Some(result);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// A source of audio files.
///
/// Implementations must be stateless with respect to the chain; any
/// session state lives inside the backend.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Unique name, used in folder names, logs and statistics.
    fn name(&self) -> &str;

    /// Lower is tried first.
    fn priority(&self) -> i32;

    /// Safe number of concurrent operations against this backend.
    fn max_concurrent(&self) -> usize {
        1
    }

    /// Called once at startup; `false` excludes the backend for the run.
    async fn validate_credentials(&self) -> bool;

    /// Look for the requested track and score the best candidate.
    async fn match_track(&self, request: &DownloadRequest) -> MatchResult;

    /// Download the requested track into `destination`.
    async fn enqueue(&self, destination: &Path, request: &DownloadRequest) -> DownloadResult;
}

/// Backends in the order they are tried.
#[derive(Clone, Default)]
pub struct DownloaderChain {
    backends: Vec<Arc<dyn Downloader>>,
}

impl DownloaderChain {
    /// Sort `backends` by ascending priority. Ties keep their given order.
    pub fn new(mut backends: Vec<Arc<dyn Downloader>>) -> Self {
        backends.sort_by_key(|b| b.priority());
        Self { backends }
    }

    /// Build a chain from the backends whose credentials validate.
    pub async fn validated(backends: Vec<Arc<dyn Downloader>>) -> Self {
        let mut usable = Vec::with_capacity(backends.len());
        for backend in backends {
            if backend.validate_credentials().await {
                tracing::info!(
                    backend = backend.name(),
                    priority = backend.priority(),
                    "Downloader ready"
                );
                usable.push(backend);
            } else {
                tracing::error!(
                    backend = backend.name(),
                    "Credential validation failed, excluding downloader for this run"
                );
            }
        }
        Self::new(usable)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Downloader>> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }
}

impl std::fmt::Debug for DownloaderChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Mock downloaders for testing.
#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::matching::Thresholds;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted backend that counts calls and tracks concurrency.
    pub struct MockDownloader {
        pub name: String,
        pub priority: i32,
        pub max_concurrent: usize,
        pub credentials_ok: bool,
        /// Confidence reported by `match_track`
        pub confidence: f32,
        /// Status returned by `enqueue`
        pub outcome: DownloadStatus,
        /// Write a partial file into the workspace on failure
        pub leave_partial: bool,
        /// Simulated work inside `enqueue`
        pub delay: Duration,
        /// Titles that fail with `Failed` even when `outcome` is a success
        pub failing_titles: Vec<String>,
        pub match_calls: AtomicUsize,
        pub enqueue_calls: AtomicUsize,
        in_flight: AtomicUsize,
        pub peak_in_flight: AtomicUsize,
        /// Destinations passed to `enqueue`, in call order
        pub destinations: Mutex<Vec<PathBuf>>,
        /// Whether the destination already had content on each call
        pub saw_existing_content: Mutex<Vec<bool>>,
    }

    impl MockDownloader {
        pub fn new(name: &str, priority: i32, outcome: DownloadStatus) -> Self {
            Self {
                name: name.to_string(),
                priority,
                max_concurrent: 1,
                credentials_ok: true,
                confidence: 0.92,
                outcome,
                leave_partial: false,
                delay: Duration::ZERO,
                failing_titles: Vec::new(),
                match_calls: AtomicUsize::new(0),
                enqueue_calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                destinations: Mutex::new(Vec::new()),
                saw_existing_content: Mutex::new(Vec::new()),
            }
        }

        pub fn succeeding(name: &str, priority: i32) -> Self {
            Self::new(name, priority, DownloadStatus::Success)
        }

        pub fn failing(name: &str, priority: i32) -> Self {
            Self::new(name, priority, DownloadStatus::Failed)
        }

        pub fn with_confidence(mut self, confidence: f32) -> Self {
            self.confidence = confidence;
            self
        }

        pub fn with_partial_files(mut self) -> Self {
            self.leave_partial = true;
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn with_failure_for(mut self, title: &str) -> Self {
            self.failing_titles.push(title.to_string());
            self
        }

        pub fn with_max_concurrent(mut self, n: usize) -> Self {
            self.max_concurrent = n;
            self
        }

        pub fn with_bad_credentials(mut self) -> Self {
            self.credentials_ok = false;
            self
        }

        pub fn enqueue_count(&self) -> usize {
            self.enqueue_calls.load(Ordering::SeqCst)
        }

        pub fn match_count(&self) -> usize {
            self.match_calls.load(Ordering::SeqCst)
        }

        pub fn peak(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Downloader for MockDownloader {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn max_concurrent(&self) -> usize {
            self.max_concurrent
        }

        async fn validate_credentials(&self) -> bool {
            self.credentials_ok
        }

        async fn match_track(&self, _request: &DownloadRequest) -> MatchResult {
            self.match_calls.fetch_add(1, Ordering::SeqCst);
            MatchResult::scored(
                self.confidence,
                &Thresholds::default(),
                Some(format!("mock://{}", self.name)),
            )
        }

        async fn enqueue(&self, destination: &Path, request: &DownloadRequest) -> DownloadResult {
            self.enqueue_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            self.destinations.lock().push(destination.to_path_buf());
            let has_content = std::fs::read_dir(destination)
                .map(|mut d| d.next().is_some())
                .unwrap_or(false);
            self.saw_existing_content.lock().push(has_content);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let outcome = if self.failing_titles.contains(&request.title) {
                DownloadStatus::Failed
            } else {
                self.outcome
            };
            let result = match outcome {
                DownloadStatus::Success => {
                    let file = destination.join(format!("{} - {}.flac", request.artist, request.title));
                    match std::fs::create_dir_all(destination).and_then(|_| std::fs::write(&file, b"flac")) {
                        Ok(()) => DownloadResult::success(destination, vec![file]),
                        Err(e) => DownloadResult::failure(DownloadStatus::Failed, e.to_string()),
                    }
                }
                status => {
                    if self.leave_partial {
                        let _ = std::fs::create_dir_all(destination)
                            .and_then(|_| std::fs::write(destination.join("partial.part"), b"..."));
                    }
                    DownloadResult::failure(status, format!("mock {} {}", self.name, status))
                }
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::MockDownloader;
    use super::*;

    #[test]
    fn test_chain_sorted_by_priority() {
        let chain = DownloaderChain::new(vec![
            Arc::new(MockDownloader::succeeding("slskd", 50)),
            Arc::new(MockDownloader::succeeding("qobuz", 10)),
            Arc::new(MockDownloader::succeeding("deemix", 20)),
        ]);
        assert_eq!(chain.names(), vec!["qobuz", "deemix", "slskd"]);
    }

    #[test]
    fn test_chain_ties_keep_order() {
        let chain = DownloaderChain::new(vec![
            Arc::new(MockDownloader::succeeding("b", 10)),
            Arc::new(MockDownloader::succeeding("a", 10)),
        ]);
        assert_eq!(chain.names(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_validated_excludes_bad_credentials() {
        let chain = DownloaderChain::validated(vec![
            Arc::new(MockDownloader::succeeding("good", 10)),
            Arc::new(MockDownloader::succeeding("bad", 5).with_bad_credentials()),
        ])
        .await;
        assert_eq!(chain.names(), vec!["good"]);
    }

    #[test]
    fn test_request_from_track() {
        let track = Track::new("Song", "Artist", "Album", "usrc1").with_release_year(1999);
        let req = DownloadRequest::from_track(&track);
        assert_eq!(req.isrc, "USRC1");
        assert_eq!(req.year, 1999);
        assert_eq!(req.query(), "Artist Song");
    }
}

//! Drives the downloader chain for one track at a time.
//!
//! For every backend, in priority order:
//!
//! 1. derive the working folder `<artist> - <album> (<year>) [<backend>]`
//! 2. move a quarantined copy of that folder back, if a previous run left one
//! 3. ask the backend for a match and skip it below the minimum confidence
//! 4. `enqueue` into the working folder
//!
//! The first success wins. Every failure is appended to the error log and
//! its working folder is moved to quarantine. A rate-limited backend stops
//! the chain for that track. When the whole chain failed, the
//! [`RetryPolicy`] decides whether another pass runs after a backoff delay.

mod error_log;
pub mod stats;

pub use error_log::{ErrorLog, FailureEntry, count_entries};
pub use stats::{DownloadStats, StatsSnapshot};

use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DownloadConfig};
use crate::downloader::{DownloadRequest, DownloadResult, DownloadStatus, Downloader, DownloaderChain};
use crate::error::{Error, Result};
use crate::matching::QualityTier;
use crate::model::{AttemptRecord, Track};
use crate::organizer::{self, MAX_COMPONENT_CHARS};

/// How many passes over the chain a track gets, and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total passes, at least 1
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: if config.retry_enabled {
                config.max_attempts.max(1)
            } else {
                1
            },
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms.max(config.backoff_base_ms)),
        }
    }

    /// A single pass, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Exponential delay before pass `round` (1-based for retries), without jitter.
    pub fn base_delay_for(&self, round: u32) -> Duration {
        let factor = 2u32.saturating_pow(round.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before pass `round` with up to 25% random jitter added.
    pub fn delay_for(&self, round: u32) -> Duration {
        let delay = self.base_delay_for(round);
        let jitter_ms = (delay.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

fn or_unknown<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() { fallback } else { value }
}

/// Album folder a backend fills for one track.
///
/// Deterministic and safe as a single path component on common filesystems.
pub fn folder_name(artist: &str, album: &str, year: i32, backend: &str) -> String {
    let artist = or_unknown(artist, "Unknown Artist");
    let album = or_unknown(album, "Unknown Album");
    let raw = if year > 0 {
        format!("{artist} - {album} ({year}) [{backend}]")
    } else {
        format!("{artist} - {album} [{backend}]")
    };
    organizer::sanitize_component(&raw, MAX_COMPONENT_CHARS)
}

/// Per-track folder holding that track's [`folder_name`] directories. Tracks
/// of one album download side by side, so each gets its own tree to fill,
/// quarantine and import.
pub fn track_folder_name(artist: &str, title: &str, isrc: &str) -> String {
    let artist = or_unknown(artist, "Unknown Artist");
    let title = or_unknown(title, "Unknown Title");
    let raw = if isrc.is_empty() {
        format!("{artist} - {title}")
    } else {
        format!("{artist} - {title} [{isrc}]")
    };
    organizer::sanitize_component(&raw, MAX_COMPONENT_CHARS)
}

fn relative_workspace(request: &DownloadRequest, backend: &str) -> PathBuf {
    Path::new(&track_folder_name(&request.artist, &request.title, &request.isrc))
        .join(folder_name(&request.artist, &request.album, request.year, backend))
}

/// Result of [`DownloadManager::acquire`].
#[derive(Debug, Clone)]
pub struct AcquireOutcome {
    /// The successful result, or the last failure
    pub result: DownloadResult,
    /// Every attempt made, in order
    pub attempts: Vec<AttemptRecord>,
    pub elapsed: Duration,
    /// The run was cancelled before the chain finished
    pub cancelled: bool,
}

impl AcquireOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }

    /// Backend that produced the successful result.
    pub fn backend(&self) -> Option<&str> {
        self.attempts
            .last()
            .filter(|a| a.status.is_success())
            .map(|a| a.backend_name.as_str())
    }
}

pub struct DownloadManager {
    chain: DownloaderChain,
    downloads_dir: PathBuf,
    failed_dir: PathBuf,
    retry: RetryPolicy,
    min_confidence: f32,
    limits: HashMap<String, Arc<Semaphore>>,
    error_log: ErrorLog,
    stats: Arc<DownloadStats>,
}

impl DownloadManager {
    pub fn new(chain: DownloaderChain, config: &Config) -> Self {
        Self::with_paths(
            chain,
            &config.paths.downloads_dir,
            &config.paths.failed_dir,
            &config.paths.error_log,
        )
        .with_retry(RetryPolicy::from_config(&config.download))
        .with_min_confidence(config.matching.min_download_confidence)
    }

    pub fn with_paths(
        chain: DownloaderChain,
        downloads_dir: &Path,
        failed_dir: &Path,
        error_log: &Path,
    ) -> Self {
        let limits = chain
            .iter()
            .map(|b| {
                (
                    b.name().to_string(),
                    Arc::new(Semaphore::new(b.max_concurrent().max(1))),
                )
            })
            .collect();
        Self {
            chain,
            downloads_dir: downloads_dir.to_path_buf(),
            failed_dir: failed_dir.to_path_buf(),
            retry: RetryPolicy::default(),
            min_confidence: 0.6,
            limits,
            error_log: ErrorLog::new(error_log),
            stats: Arc::new(DownloadStats::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn chain(&self) -> &DownloaderChain {
        &self.chain
    }

    pub fn has_backends(&self) -> bool {
        !self.chain.is_empty()
    }

    pub fn stats(&self) -> Arc<DownloadStats> {
        self.stats.clone()
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    /// Where a failed attempt of `backend` for `request` is kept.
    pub fn quarantine_path(&self, request: &DownloadRequest, backend: &str) -> PathBuf {
        self.failed_dir.join(relative_workspace(request, backend))
    }

    /// Where `backend` downloads `request` to.
    pub fn workspace_path(&self, request: &DownloadRequest, backend: &str) -> PathBuf {
        self.downloads_dir.join(relative_workspace(request, backend))
    }

    /// Drop the empty per-track folders left above `workspace` once its
    /// content has been imported or quarantined.
    pub async fn tidy(&self, workspace: &Path) {
        let root = if workspace.starts_with(&self.failed_dir) {
            self.failed_dir.clone()
        } else {
            self.downloads_dir.clone()
        };
        let path = workspace.to_path_buf();
        let cleaned = tokio::task::spawn_blocking(move || {
            // The import may already have removed the workspace itself
            let start = match path.parent() {
                Some(parent) if !path.exists() => parent,
                _ => path.as_path(),
            };
            organizer::remove_empty_dirs(start, &root)
        })
        .await;
        match cleaned {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(workspace = ?workspace, "Failed to remove empty folders: {:#}", e),
            Err(e) => tracing::warn!(workspace = ?workspace, "Cleanup task failed: {}", e),
        }
    }

    /// Try the chain until a backend succeeds, the chain is rate limited,
    /// the retry budget runs out or `cancel` fires.
    pub async fn acquire(&self, track: &Track, cancel: &CancellationToken) -> AcquireOutcome {
        let started = Instant::now();
        let request = DownloadRequest::from_track(track);
        let mut attempts = Vec::new();
        let mut last = DownloadResult::failure(DownloadStatus::NotFound, "no downloaders available");
        let mut cancelled = false;

        'passes: for round in 0..self.retry.max_attempts {
            if round > 0 {
                let delay = self.retry.delay_for(round);
                tracing::info!(
                    track = %track.label(),
                    round = round + 1,
                    delay_ms = delay.as_millis() as u64,
                    "All downloaders failed, retrying chain"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break 'passes;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            for backend in self.chain.iter() {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'passes;
                }

                let (record, result) = self.attempt(backend.as_ref(), &request, round, cancel).await;
                let status = record.status;
                attempts.push(record);

                if result.is_success() {
                    tracing::info!(
                        track = %track.label(),
                        backend = backend.name(),
                        "Download succeeded"
                    );
                    return AcquireOutcome {
                        result,
                        attempts,
                        elapsed: started.elapsed(),
                        cancelled: false,
                    };
                }
                last = result;

                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'passes;
                }
                if status == DownloadStatus::RateLimited {
                    tracing::warn!(
                        track = %track.label(),
                        backend = backend.name(),
                        "Rate limited, giving up on this track for this run"
                    );
                    break 'passes;
                }
            }
        }

        AcquireOutcome {
            result: last,
            attempts,
            elapsed: started.elapsed(),
            cancelled,
        }
    }

    /// One (track, backend) attempt including its bookkeeping.
    async fn attempt(
        &self,
        backend: &dyn Downloader,
        request: &DownloadRequest,
        round: u32,
        cancel: &CancellationToken,
    ) -> (AttemptRecord, DownloadResult) {
        let started = Instant::now();
        let name = backend.name();
        let workspace = self.workspace_path(request, name);
        let quarantine = self.quarantine_path(request, name);

        let _permit = match self.limits.get(name) {
            Some(limit) => match limit.acquire().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    tracing::error!(backend = name, "Concurrency limit closed: {}", e);
                    None
                }
            },
            None => None,
        };

        let mut tier = QualityTier::None;
        let mut confidence = 0.0;
        let result = if let Err(e) = self.restore(&quarantine, &workspace).await {
            DownloadResult::failure(DownloadStatus::Failed, e.to_string())
        } else {
            let matched = backend.match_track(request).await;
            tier = matched.quality_tier;
            confidence = matched.confidence;
            tracing::debug!(
                backend = name,
                confidence = matched.confidence,
                tier = %matched.quality_tier,
                "Match evaluated"
            );

            if !matched.is_acceptable(self.min_confidence) {
                let message = format!(
                    "best match {:.2} ({}) below minimum {:.2}",
                    matched.confidence, matched.quality_tier, self.min_confidence
                );
                DownloadResult::failure(DownloadStatus::NotFound, message).with_match(matched)
            } else {
                tokio::select! {
                    result = backend.enqueue(&workspace, request) => result,
                    _ = cancel.cancelled() => {
                        DownloadResult::failure(DownloadStatus::Failed, "cancelled").with_match(matched)
                    }
                }
            }
        };

        if let Some(verified) = &result.match_result
            && result.is_success()
        {
            tier = verified.quality_tier;
            confidence = verified.confidence;
        }

        self.stats.record(name, result.status, tier);

        if !result.is_success() {
            self.record_failure(name, request, &result, round, &workspace, &quarantine)
                .await;
        }

        let record = AttemptRecord {
            backend_name: name.to_string(),
            status: result.status,
            match_quality: tier,
            confidence,
            error_message: result.error_message.clone(),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            retry_round: round,
        };
        (record, result)
    }

    /// Bring a quarantined folder back so the backend can resume.
    async fn restore(&self, quarantine: &Path, workspace: &Path) -> Result<()> {
        if !tokio::fs::try_exists(quarantine).await.unwrap_or(false) {
            return Ok(());
        }
        relocate(quarantine, workspace).await?;
        tracing::info!(from = ?quarantine, to = ?workspace, "Restored quarantined download");
        if let Some(track_dir) = quarantine.parent() {
            self.tidy(track_dir).await;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        backend: &str,
        request: &DownloadRequest,
        result: &DownloadResult,
        round: u32,
        workspace: &Path,
        quarantine: &Path,
    ) {
        tracing::warn!(
            backend,
            track = %format!("{} - {}", request.artist, request.title),
            status = %result.status,
            "Download attempt failed: {}",
            result.error_message
        );

        let entry = FailureEntry {
            backend,
            request,
            status: result.status,
            message: &result.error_message,
            retry_round: round,
        };
        if let Err(e) = self.error_log.append(entry).await {
            tracing::error!(path = ?self.error_log.path(), "Failed to write error log: {}", e);
        }

        if tokio::fs::try_exists(workspace).await.unwrap_or(false) {
            match relocate(workspace, quarantine).await {
                Ok(()) => {
                    tracing::info!(from = ?workspace, to = ?quarantine, "Quarantined failed download");
                    if let Some(track_dir) = workspace.parent() {
                        self.tidy(track_dir).await;
                    }
                }
                Err(e) => tracing::error!(workspace = ?workspace, "Failed to quarantine: {}", e),
            }
        }
    }
}


/// Move `from` to `to`, replacing whatever is at `to`.
async fn relocate(from: &Path, to: &Path) -> Result<()> {
    let (from, to) = (from.to_path_buf(), to.to_path_buf());
    let label = format!("moving {:?} to {:?}", from, to);
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        if to.is_dir() {
            std::fs::remove_dir_all(&to)?;
        } else if to.exists() {
            std::fs::remove_file(&to)?;
        }
        organizer::move_path(&from, &to)
    })
    .await
    .map_err(|e| Error::download(format!("{label}: {e}")))?
    .map_err(|e| Error::download(format!("{label}: {e:#}")))
}

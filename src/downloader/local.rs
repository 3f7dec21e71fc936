//! Backend that picks tracks out of a local staging directory.
//!
//! Useful for files dropped in by hand or by another tool: every audio
//! file under `staging_dir` is a candidate, scored with the matcher.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{DownloadRequest, DownloadResult, DownloadStatus, Downloader};
use crate::config::{DownloaderConfig, MatchingConfig};
use crate::error::{Error, Result};
use crate::matching::{self, MatchResult, Thresholds};
use crate::metadata;

pub struct LocalDownloader {
    name: String,
    priority: i32,
    max_concurrent: usize,
    staging_dir: PathBuf,
    thresholds: Thresholds,
    min_confidence: f32,
}

impl LocalDownloader {
    pub fn new(name: impl Into<String>, priority: i32, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            priority,
            max_concurrent: 4,
            staging_dir: staging_dir.into(),
            thresholds: Thresholds::default(),
            min_confidence: MatchingConfig::default().min_download_confidence,
        }
    }

    pub fn from_config(config: &DownloaderConfig, matching: &MatchingConfig) -> Result<Self> {
        let staging_dir = config.staging_dir.clone().ok_or_else(|| {
            Error::download(format!("downloader '{}' needs staging_dir", config.name))
        })?;
        Ok(Self {
            name: config.name.clone(),
            priority: config.priority,
            max_concurrent: config.max_concurrent.max(1),
            staging_dir,
            thresholds: matching.thresholds(),
            min_confidence: matching.min_download_confidence,
        })
    }

    /// Best-scoring staged file for `request`.
    async fn best_candidate(&self, request: &DownloadRequest) -> Option<(PathBuf, MatchResult)> {
        let dir = self.staging_dir.clone();
        let request = request.clone();
        let thresholds = self.thresholds;

        let joined = tokio::task::spawn_blocking(move || {
            let target = request.as_track();
            walkdir::WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && metadata::is_audio_file(e.path()))
                .map(|e| {
                    let meta = metadata::read_or_guess(e.path());
                    let isrc_hit = target.has_isrc()
                        && meta.isrc.as_deref().is_some_and(|i| i == target.isrc);
                    let confidence = if isrc_hit {
                        1.0
                    } else {
                        matching::score(&meta.to_candidate(), &target)
                    };
                    let locator = e.path().to_string_lossy().into_owned();
                    let result = MatchResult::scored(confidence, &thresholds, Some(locator))
                        .with_evidence("artist", meta.artist)
                        .with_evidence("title", meta.title)
                        .with_evidence("isrc_match", isrc_hit.to_string());
                    (e.into_path(), result)
                })
                .max_by(|a, b| a.1.confidence.total_cmp(&b.1.confidence))
        })
        .await;

        match joined {
            Ok(best) => best,
            Err(e) => {
                tracing::error!(backend = %self.name, "Staging scan failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Downloader for LocalDownloader {
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
        self.staging_dir.is_dir()
    }

    async fn match_track(&self, request: &DownloadRequest) -> MatchResult {
        self.best_candidate(request)
            .await
            .map(|(_, result)| result)
            .unwrap_or_else(MatchResult::not_found)
    }

    async fn enqueue(&self, destination: &Path, request: &DownloadRequest) -> DownloadResult {
        let Some((source, result)) = self.best_candidate(request).await else {
            return DownloadResult::failure(DownloadStatus::NotFound, "no staged files");
        };
        if !result.is_acceptable(self.min_confidence) {
            let message = format!(
                "best staged candidate scored {:.2}, below {:.2}",
                result.confidence, self.min_confidence
            );
            return DownloadResult::failure(DownloadStatus::NotFound, message).with_match(result);
        }

        let Some(file_name) = source.file_name() else {
            return DownloadResult::failure(DownloadStatus::Failed, "staged file has no name");
        };
        let target = destination.join(file_name);
        let copy = async {
            tokio::fs::create_dir_all(destination).await?;
            tokio::fs::copy(&source, &target).await
        };
        match copy.await {
            Ok(_) => DownloadResult::success(destination, vec![target]).with_match(result),
            Err(e) => DownloadResult::failure(
                DownloadStatus::Failed,
                format!("copying {:?} failed: {e}", source),
            )
            .with_match(result),
        }
    }
}

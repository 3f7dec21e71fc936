//! Cumulative download counters, persisted as an advisory JSON snapshot.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::downloader::DownloadStatus;
use crate::error::{Result, ResultExt};
use crate::matching::QualityTier;

/// Counters for one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendCounters {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub timeouts: u64,
}

/// Serializable view of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub backends: BTreeMap<String, BackendCounters>,
    /// Successful downloads per match quality tier
    pub quality_tiers: BTreeMap<QualityTier, u64>,
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// Thread-safe counters updated by every attempt.
#[derive(Debug)]
pub struct DownloadStats {
    inner: Mutex<StatsSnapshot>,
}

impl Default for DownloadStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsSnapshot {
                started_at: Some(Utc::now()),
                ..Default::default()
            }),
        }
    }

    pub fn record(&self, backend: &str, status: DownloadStatus, tier: QualityTier) {
        let mut stats = self.inner.lock();
        stats.attempts += 1;
        stats.updated_at = Some(Utc::now());

        let counters = stats.backends.entry(backend.to_string()).or_default();
        counters.attempts += 1;
        match status {
            DownloadStatus::Success => counters.successes += 1,
            DownloadStatus::RateLimited => {
                counters.failures += 1;
                counters.rate_limited += 1;
            }
            DownloadStatus::Timeout => {
                counters.failures += 1;
                counters.timeouts += 1;
            }
            _ => counters.failures += 1,
        }

        if status.is_success() {
            stats.successes += 1;
            *stats.quality_tiers.entry(tier).or_default() += 1;
        } else {
            stats.failures += 1;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().clone()
    }

    /// Overwrite `path` with the current counters (temp file, then rename).
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(format!("creating {:?}", parent))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(format!("writing {:?}", tmp))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(format!("replacing {:?}", path))?;
        tracing::debug!(path = ?path, "Download statistics saved");
        Ok(())
    }
}

/// Read a statistics file written by [`DownloadStats::persist`].
pub fn load(path: &Path) -> Result<StatsSnapshot> {
    let text = std::fs::read_to_string(path).with_context(format!("reading {:?}", path))?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_counts_per_backend_and_tier() {
        let stats = DownloadStats::new();
        stats.record("qobuz", DownloadStatus::Success, QualityTier::High);
        stats.record("qobuz", DownloadStatus::Failed, QualityTier::None);
        stats.record("slskd", DownloadStatus::RateLimited, QualityTier::None);
        stats.record("slskd", DownloadStatus::Success, QualityTier::High);

        let snap = stats.snapshot();
        assert_eq!(snap.attempts, 4);
        assert_eq!(snap.successes, 2);
        assert_eq!(snap.failures, 2);
        assert_eq!(snap.backends["qobuz"].failures, 1);
        assert_eq!(snap.backends["slskd"].rate_limited, 1);
        assert_eq!(snap.quality_tiers[&QualityTier::High], 2);
        assert!((snap.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("download_stats.json");
        let stats = DownloadStats::new();
        stats.record("local", DownloadStatus::Success, QualityTier::Exact);

        stats.persist(&path).await.unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, stats.snapshot());
        assert!(!path.with_extension("json.tmp").exists());
    }
}

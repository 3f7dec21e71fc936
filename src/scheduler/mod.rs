//! Periodic and one-shot reconciliation.
//!
//! Each enabled playlist and user is a job with its own interval. All jobs
//! run once at start, then on their interval until the cancellation token
//! fires. Download statistics are persisted on their own timer and once
//! more on shutdown.
//!
//! # Usage
//!
//! ```ignore
//! let scheduler = Arc::new(Scheduler::new(config.clone(), reconciler));
//! let cancel = CancellationToken::new();
//! scheduler::cancel_on_ctrl_c(cancel.clone());
//! scheduler.run(cancel).await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError, MAX_INTERVAL_MINUTES};
use crate::error::{Error, Result};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::sync_state::StateError;

/// A unit of scheduled work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// A configured playlist, by name
    Playlist(String),
    /// Every playlist of a configured user, by name
    User(String),
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Playlist(name) => write!(f, "playlist '{}'", name),
            Job::User(name) => write!(f, "user '{}'", name),
        }
    }
}

pub struct Scheduler {
    config: Arc<Config>,
    reconciler: Arc<Reconciler>,
    stats_file: PathBuf,
    stats_interval: Duration,
}

impl Scheduler {
    pub fn new(config: Arc<Config>, reconciler: Arc<Reconciler>) -> Self {
        let stats_file = config.paths.stats_file.clone();
        let stats_interval = minutes(config.download.stats_interval_minutes);
        Self {
            config,
            reconciler,
            stats_file,
            stats_interval,
        }
    }

    pub fn with_stats_interval(mut self, every: Duration) -> Self {
        self.stats_interval = every;
        self
    }

    /// Enabled jobs and their intervals, playlists first.
    pub fn jobs(&self) -> Vec<(Job, Duration)> {
        let playlists = self
            .config
            .playlists
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, p)| (Job::Playlist(name.clone()), minutes(p.schedule_minutes)));
        let users = self
            .config
            .users
            .iter()
            .filter(|(_, u)| u.enabled)
            .map(|(name, u)| (Job::User(name.clone()), minutes(u.schedule_minutes)));
        playlists.chain(users).collect()
    }

    /// Run every enabled job once, or only the playlist or user named `only`.
    pub async fn sync_once(
        &self,
        only: Option<&str>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReconcileReport>> {
        let jobs: Vec<Job> = match only {
            Some(name) => {
                let job = if self.config.playlists.contains_key(name) {
                    Job::Playlist(name.to_string())
                } else if self.config.users.contains_key(name) {
                    Job::User(name.to_string())
                } else {
                    return Err(Error::Config(ConfigError::Invalid(vec![format!(
                        "no playlist or user named '{name}'"
                    )])));
                };
                vec![job]
            }
            None => self.jobs().into_iter().map(|(job, _)| job).collect(),
        };

        let mut reports = Vec::new();
        for job in jobs {
            if cancel.is_cancelled() {
                break;
            }
            reports.extend(self.run_job(&job, force, cancel).await);
        }
        self.persist_stats().await;
        Ok(reports)
    }

    /// Run all jobs on their intervals until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let jobs = self.jobs();
        if jobs.is_empty() {
            tracing::warn!(target: "scheduler", "No enabled playlists or users to schedule");
        }
        tracing::info!(target: "scheduler", jobs = jobs.len(), "Scheduler started");

        let mut tasks = JoinSet::new();
        for (job, every) in jobs {
            let this = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { this.job_loop(job, every, cancel).await });
        }
        {
            let this = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { this.stats_loop(cancel).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(target: "scheduler", "Scheduled task failed: {}", e);
            }
        }

        self.persist_stats().await;
        tracing::info!(target: "scheduler", "Scheduler stopped");
        Ok(())
    }

    async fn job_loop(&self, job: Job, every: Duration, cancel: CancellationToken) {
        let mut timer = interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(target: "scheduler", job = %job, every_secs = every.as_secs(), "Scheduled");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    self.run_job(&job, false, &cancel).await;
                }
            }
        }
    }

    async fn stats_loop(&self, cancel: CancellationToken) {
        let mut timer = interval(self.stats_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick is immediate and there is nothing to write yet
        timer.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = timer.tick() => self.persist_stats().await,
            }
        }
    }

    /// Run one job. Failures are logged, never returned.
    pub async fn run_job(
        &self,
        job: &Job,
        force: bool,
        cancel: &CancellationToken,
    ) -> Vec<ReconcileReport> {
        match job {
            Job::Playlist(name) => {
                let Some(playlist) = self.config.playlists.get(name) else {
                    tracing::warn!(target: "scheduler", playlist = %name, "Not configured, skipping");
                    return Vec::new();
                };
                match self.reconciler.reconcile(name, playlist, force, cancel).await {
                    Ok(report) => vec![report],
                    Err(Error::StateStore(StateError::Busy(_))) => {
                        tracing::warn!(target: "scheduler", playlist = %name, "Previous run still in progress, skipping");
                        Vec::new()
                    }
                    Err(e) => {
                        tracing::error!(target: "scheduler", playlist = %name, "Sync failed: {}", e);
                        Vec::new()
                    }
                }
            }
            Job::User(name) => {
                let Some(user) = self.config.users.get(name) else {
                    tracing::warn!(target: "scheduler", user = %name, "Not configured, skipping");
                    return Vec::new();
                };
                match self.reconciler.sync_user(name, user, force, cancel).await {
                    Ok(reports) => reports,
                    Err(e) => {
                        tracing::error!(target: "scheduler", user = %name, "Sync failed: {}", e);
                        Vec::new()
                    }
                }
            }
        }
    }

    async fn persist_stats(&self) {
        let stats = self.reconciler.downloads().stats();
        if stats.snapshot().attempts == 0 {
            return;
        }
        match stats.persist(&self.stats_file).await {
            Ok(()) => tracing::debug!(target: "scheduler", path = ?self.stats_file, "Saved download statistics"),
            Err(e) => tracing::warn!(target: "scheduler", path = ?self.stats_file, "Saving download statistics failed: {}", e),
        }
    }
}

/// Cancel `token` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!(target: "scheduler", "Interrupted, finishing in-flight work");
                token.cancel();
            }
            Err(e) => tracing::warn!(target: "scheduler", "Cannot listen for Ctrl-C: {}", e),
        }
    });
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.clamp(1, MAX_INTERVAL_MINUTES).saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PlaylistConfig, UserConfig};
    use crate::download_manager::{DownloadManager, RetryPolicy};
    use crate::downloader::DownloaderChain;
    use crate::downloader::mocks::MockDownloader;
    use crate::importer::mocks::MockImporter;
    use crate::library::mocks::MockLibrary;
    use crate::publisher::mocks::MockPublisher;
    use crate::sync_state::SyncStateStore;
    use crate::test_utils::{snapshot_of, track};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths.stats_file = dir.path().join("stats.json");
        config.playlists.insert(
            "hits".into(),
            PlaylistConfig {
                url: "mock://hits".into(),
                destinations: vec!["alice".into()],
                ..Default::default()
            },
        );
        config.playlists.insert(
            "old".into(),
            PlaylistConfig {
                url: "mock://old".into(),
                enabled: false,
                schedule_minutes: 5,
                ..Default::default()
            },
        );
        config.users.insert(
            "bob".into(),
            UserConfig {
                user_id: "bob-id".into(),
                ..Default::default()
            },
        );
        config
    }

    fn scheduler(dir: &TempDir, importer: Arc<MockImporter>) -> Scheduler {
        let downloads = DownloadManager::with_paths(
            DownloaderChain::new(vec![Arc::new(MockDownloader::succeeding("qobuz", 10))]),
            &dir.path().join("downloads"),
            &dir.path().join("failed"),
            &dir.path().join("errors.log"),
        );
        let reconciler = Reconciler::new(
            importer,
            Arc::new(MockLibrary::new()),
            Arc::new(downloads),
            Arc::new(MockPublisher::new()),
            SyncStateStore::new(dir.path().join("state")),
        )
        .with_fetch_retry(RetryPolicy::once());
        Scheduler::new(Arc::new(config(dir)), Arc::new(reconciler))
    }

    fn importer() -> Arc<MockImporter> {
        let mut mix = snapshot_of("m1", vec![]);
        mix.title = "Mix".into();
        Arc::new(
            MockImporter::new()
                .with_playlist("mock://hits", snapshot_of("s1", vec![track("A", "Artist", "One")]))
                .with_playlist("mock://old", snapshot_of("o1", vec![]))
                .with_user("bob-id", vec![mix]),
        )
    }

    #[test]
    fn test_jobs_skip_disabled() {
        let dir = TempDir::new().unwrap();
        let jobs = scheduler(&dir, importer()).jobs();
        assert_eq!(
            jobs,
            vec![
                (Job::Playlist("hits".into()), Duration::from_secs(60 * 60)),
                (Job::User("bob".into()), Duration::from_secs(720 * 60)),
            ]
        );
    }

    #[test]
    fn test_minutes_is_bounded() {
        assert_eq!(minutes(0), Duration::from_secs(60));
        assert_eq!(minutes(u64::MAX), Duration::from_secs(MAX_INTERVAL_MINUTES * 60));
        let _ = tokio::time::Instant::now() + minutes(u64::MAX);
    }

    #[tokio::test]
    async fn test_sync_once_runs_enabled_jobs() {
        let dir = TempDir::new().unwrap();
        let importer = importer();
        let s = scheduler(&dir, importer.clone());

        let reports = s.sync_once(None, false, &CancellationToken::new()).await.unwrap();
        let names: Vec<_> = reports.iter().map(|r| r.playlist.as_str()).collect();
        assert_eq!(names, vec!["hits", "bob_Mix"]);
        assert_eq!(reports[0].downloaded, 1);
        // The download was recorded, so statistics were written
        assert!(dir.path().join("stats.json").exists());
    }

    #[tokio::test]
    async fn test_sync_once_filter() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir, importer());

        let reports = s
            .sync_once(Some("old"), false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].playlist, "old");

        let err = s
            .sync_once(Some("nope"), false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let importer = importer();
        let s = Arc::new(scheduler(&dir, importer.clone()).with_stats_interval(Duration::from_millis(20)));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(s.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // One immediate run per enabled job: the playlist fetch and the user listing
        assert_eq!(importer.fetch_count(), 2);
        assert!(dir.path().join("stats.json").exists());
    }
}

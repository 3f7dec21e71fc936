//! Playlist reconciliation.
//!
//! One run per playlist walks these states:
//!
//! ```text
//! Loaded -> Fetched -> Diffed -> Merging -> Resolving -> Persisting -> PublishCheck -> Publishing -> Done
//!                         \____________________ unchanged _________________/
//! ```
//!
//! When the fetched `snapshot_id` equals the cached one (and no update is
//! forced) the run goes straight from `Diffed` to `PublishCheck`, so an
//! unchanged playlist costs one fetch and no track work.

use futures::{StreamExt, stream};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{COLLECTION_DESTINATION, Config, PlaylistConfig, UserConfig};
use crate::download_manager::{DownloadManager, RetryPolicy};
use crate::error::Result;
use crate::importer::{self, FetchedPlaylist, PlaylistImporter, UserPlaylistOptions};
use crate::library::{LibraryIndex, LibraryQuery};
use crate::model::{PlaylistSnapshot, Track, TrackStatus, merge_tracklists};
use crate::publisher::PlaylistPublisher;
use crate::sync_state::{PlaylistLock, SyncStateStore};

/// Where a reconciliation run is (or stopped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    #[default]
    Loaded,
    Fetched,
    Diffed,
    Merging,
    Resolving,
    Persisting,
    PublishCheck,
    Publishing,
    Done,
}

impl ReconcileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileState::Loaded => "loaded",
            ReconcileState::Fetched => "fetched",
            ReconcileState::Diffed => "diffed",
            ReconcileState::Merging => "merging",
            ReconcileState::Resolving => "resolving",
            ReconcileState::Persisting => "persisting",
            ReconcileState::PublishCheck => "publish_check",
            ReconcileState::Publishing => "publishing",
            ReconcileState::Done => "done",
        }
    }
}

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub playlist: String,
    pub state: ReconcileState,
    pub total: usize,
    pub resolved: usize,
    pub found_in_library: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub not_available: usize,
    pub published: Vec<String>,
    pub publish_failed: Vec<String>,
    /// The snapshot was unchanged and track work was skipped
    pub skipped_resolution: bool,
    pub complete_fetch: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl ReconcileReport {
    fn new(playlist: &str) -> Self {
        Self {
            playlist: playlist.to_string(),
            complete_fetch: true,
            ..Default::default()
        }
    }

    fn count(&mut self, tracks: &[Track]) {
        self.total = tracks.len();
        self.resolved = tracks.iter().filter(|t| t.is_resolved()).count();
        let with_status = |s: TrackStatus| tracks.iter().filter(|t| t.status == s).count();
        self.found_in_library = with_status(TrackStatus::FoundInLibrary);
        self.downloaded = with_status(TrackStatus::Downloaded);
        self.failed = with_status(TrackStatus::DownloadFailed);
        self.not_available = with_status(TrackStatus::NotAvailable);
    }
}

impl std::fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}/{} resolved ({} in library, {} downloaded, {} failed, {} unavailable)",
            self.playlist,
            self.resolved,
            self.total,
            self.found_in_library,
            self.downloaded,
            self.failed,
            self.not_available
        )?;
        if self.skipped_resolution {
            write!(f, ", unchanged")?;
        }
        if !self.complete_fetch {
            write!(f, ", partial fetch")?;
        }
        if !self.published.is_empty() {
            write!(f, ", published to {}", self.published.join(", "))?;
        }
        if !self.publish_failed.is_empty() {
            write!(f, ", publish failed for {}", self.publish_failed.join(", "))?;
        }
        if self.cancelled {
            write!(f, ", cancelled")?;
        }
        write!(f, " in {:.1}s", self.elapsed.as_secs_f64())
    }
}

/// Reconciles playlists against the library, the downloaders and the publisher.
pub struct Reconciler {
    importer: Arc<dyn PlaylistImporter>,
    library: Arc<dyn LibraryIndex>,
    downloads: Arc<DownloadManager>,
    publisher: Arc<dyn PlaylistPublisher>,
    store: SyncStateStore,
    fetch_retry: RetryPolicy,
    allow_fuzzy: bool,
    max_concurrent_tracks: usize,
}

impl Reconciler {
    pub fn new(
        importer: Arc<dyn PlaylistImporter>,
        library: Arc<dyn LibraryIndex>,
        downloads: Arc<DownloadManager>,
        publisher: Arc<dyn PlaylistPublisher>,
        store: SyncStateStore,
    ) -> Self {
        Self {
            importer,
            library,
            downloads,
            publisher,
            store,
            fetch_retry: RetryPolicy::default(),
            allow_fuzzy: true,
            max_concurrent_tracks: 4,
        }
    }

    /// Apply the `[library]` and `[download]` settings of `config`.
    pub fn configured(mut self, config: &Config) -> Self {
        self.fetch_retry = RetryPolicy::from_config(&config.download);
        self.allow_fuzzy = config.library.fuzzy_lookups;
        self.max_concurrent_tracks = config.download.max_concurrent_tracks.max(1);
        self
    }

    pub fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }

    pub fn with_fuzzy_lookups(mut self, allow: bool) -> Self {
        self.allow_fuzzy = allow;
        self
    }

    pub fn with_max_concurrent_tracks(mut self, n: usize) -> Self {
        self.max_concurrent_tracks = n.max(1);
        self
    }

    pub fn store(&self) -> &SyncStateStore {
        &self.store
    }

    pub fn downloads(&self) -> &Arc<DownloadManager> {
        &self.downloads
    }

    /// Fetch and reconcile one configured playlist. `name` keys its state.
    pub async fn reconcile(
        &self,
        name: &str,
        playlist: &PlaylistConfig,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let lock = self.store.try_lock(name)?;
        let cached = self.store.load(name).await?;
        tracing::debug!(playlist = name, cached = cached.is_some(), "Loaded");

        let fetched = importer::with_backoff(self.fetch_retry, name, || {
            self.importer.get_playlist_tracks(&playlist.url, None)
        })
        .await
        .inspect_err(|e| tracing::error!(playlist = name, url = %playlist.url, "Fetch failed: {}", e))?;

        self.run(lock, name, playlist, cached, fetched, force, cancel)
            .await
    }

    /// Reconcile a playlist whose tracks were already fetched.
    pub async fn reconcile_fetched(
        &self,
        name: &str,
        playlist: &PlaylistConfig,
        fetched: FetchedPlaylist,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let lock = self.store.try_lock(name)?;
        let cached = self.store.load(name).await?;
        self.run(lock, name, playlist, cached, fetched, force, cancel)
            .await
    }

    /// Reconcile every playlist of a user as `<user>_<playlist title>`.
    ///
    /// A failing playlist is logged and does not stop the others.
    pub async fn sync_user(
        &self,
        user_name: &str,
        user: &UserConfig,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReconcileReport>> {
        let options = UserPlaylistOptions {
            include_collaborative: user.include_collaborative,
            include_followed: user.include_followed,
        };
        let playlists = importer::with_backoff(self.fetch_retry, user_name, || {
            self.importer.get_user_playlists(&user.user_id, options)
        })
        .await
        .inspect_err(|e| tracing::error!(user = user_name, "Listing playlists failed: {}", e))?;

        tracing::info!(user = user_name, playlists = playlists.len(), "Syncing user playlists");

        let mut reports = Vec::with_capacity(playlists.len());
        for fetched in playlists {
            if cancel.is_cancelled() {
                tracing::info!(user = user_name, "Cancelled, skipping remaining playlists");
                break;
            }
            let name = format!("{}_{}", user_name, fetched.snapshot.title);
            let playlist = user.playlist_config(fetched.snapshot.url.clone());
            match self
                .reconcile_fetched(&name, &playlist, fetched, force, cancel)
                .await
            {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(playlist = %name, "Reconciliation failed: {}", e),
            }
        }
        Ok(reports)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        _lock: PlaylistLock,
        name: &str,
        playlist: &PlaylistConfig,
        cached: Option<PlaylistSnapshot>,
        fetched: FetchedPlaylist,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let started = Instant::now();
        let mut report = ReconcileReport::new(name);
        let FetchedPlaylist {
            snapshot: mut current,
            complete,
        } = fetched;
        report.complete_fetch = complete;
        enter(&mut report, ReconcileState::Fetched);

        if let Some(title) = &playlist.title {
            current.title = title.clone();
        }
        let targets: BTreeSet<String> = playlist.publish_targets().into_iter().collect();

        enter(&mut report, ReconcileState::Diffed);
        let forced = force || playlist.force_update;
        let mut snapshot = match cached {
            Some(mut previous)
                if !forced
                    && !previous.snapshot_id.is_empty()
                    && previous.snapshot_id == current.snapshot_id =>
            {
                tracing::info!(
                    playlist = name,
                    snapshot_id = %previous.snapshot_id,
                    "Unchanged, skipping track resolution"
                );
                report.skipped_resolution = true;
                previous.publish_targets = targets;
                previous
            }
            previous => {
                let (previous_id, previous_tracks, publish_status) = match previous {
                    Some(p) => (p.snapshot_id, p.tracks, p.publish_status),
                    None => Default::default(),
                };

                enter(&mut report, ReconcileState::Merging);
                current.tracks = merge_tracklists(std::mem::take(&mut current.tracks), &previous_tracks);
                current.publish_status = publish_status;
                current.publish_targets = targets;

                enter(&mut report, ReconcileState::Resolving);
                report.cancelled = self
                    .resolve_all(name, &mut current.tracks, playlist.download_missing, cancel)
                    .await;

                enter(&mut report, ReconcileState::Persisting);
                if !complete || report.cancelled {
                    tracing::warn!(
                        playlist = name,
                        complete,
                        cancelled = report.cancelled,
                        "Keeping previous snapshot id until a full pass completes"
                    );
                    current.snapshot_id = previous_id;
                }
                self.store.save(name, &current).await.inspect_err(|e| {
                    tracing::error!(playlist = name, "Persisting sync state failed: {}", e)
                })?;
                current
            }
        };

        enter(&mut report, ReconcileState::PublishCheck);
        let pending = snapshot.pending_destinations();
        if !pending.is_empty() && !report.cancelled {
            enter(&mut report, ReconcileState::Publishing);
            for destination in pending {
                let as_collection = destination == COLLECTION_DESTINATION;
                match self.publisher.publish(&snapshot, &destination, as_collection).await {
                    Ok(outcome) if outcome.published => {
                        tracing::info!(playlist = name, destination = %destination, "{}", outcome.message);
                        snapshot.mark_published(&destination);
                        report.published.push(destination);
                    }
                    Ok(outcome) => {
                        tracing::warn!(playlist = name, destination = %destination, "Publish declined: {}", outcome.message);
                        report.publish_failed.push(destination);
                    }
                    Err(e) => {
                        tracing::error!(playlist = name, destination = %destination, "Publish failed: {}", e);
                        report.publish_failed.push(destination);
                    }
                }
            }
            if !report.published.is_empty() {
                self.store.save(name, &snapshot).await.inspect_err(|e| {
                    tracing::error!(playlist = name, "Persisting publish status failed: {}", e)
                })?;
            }
        }

        enter(&mut report, ReconcileState::Done);
        report.count(&snapshot.tracks);
        report.elapsed = started.elapsed();
        tracing::info!("{}", report);
        Ok(report)
    }

    /// Resolve every track without a local path. Returns whether the run was
    /// cancelled before all tracks were handled.
    async fn resolve_all(
        &self,
        playlist: &str,
        tracks: &mut [Track],
        download_missing: bool,
        cancel: &CancellationToken,
    ) -> bool {
        let pending: Vec<usize> = tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_resolved())
            .map(|(i, _)| i)
            .collect();
        tracing::info!(
            playlist,
            total = tracks.len(),
            unresolved = pending.len(),
            "Resolving tracks"
        );

        let snapshot: &[Track] = tracks;
        let resolved: Vec<(usize, Track)> = stream::iter(pending.into_iter().map(move |i| {
            let track = snapshot[i].clone();
            async move {
                (
                    i,
                    self.resolve_track(playlist, track, download_missing, cancel)
                        .await,
                )
            }
        }))
        .buffer_unordered(self.max_concurrent_tracks)
        .collect()
        .await;

        for (i, track) in resolved {
            tracks[i] = track;
        }
        cancel.is_cancelled()
    }

    async fn resolve_track(
        &self,
        playlist: &str,
        mut track: Track,
        download_missing: bool,
        cancel: &CancellationToken,
    ) -> Track {
        if cancel.is_cancelled() {
            return track;
        }
        let label = track.label();

        match self
            .library
            .exists(&LibraryQuery::for_track(&track, self.allow_fuzzy))
            .await
        {
            Ok(Some(path)) => {
                tracing::debug!(playlist, track = %label, path = ?path, "Found in library");
                track.mark_found_in_library(path);
                return track;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(playlist, track = %label, "Library lookup failed: {}", e);
                return track;
            }
        }

        if !download_missing {
            track.mark_not_available();
            return track;
        }
        if !self.downloads.has_backends() {
            tracing::debug!(playlist, track = %label, "Missing and no downloaders configured");
            return track;
        }

        let outcome = self.downloads.acquire(&track, cancel).await;
        let elapsed = outcome.elapsed.as_secs_f64();
        if !outcome.is_success() {
            tracing::warn!(
                playlist,
                track = %label,
                attempts = outcome.attempts.len(),
                status = %outcome.result.status,
                "Download failed: {}",
                outcome.result.error_message
            );
            track.record_acquisition(outcome.attempts, false, elapsed);
            track.mark_download_failed();
            return track;
        }

        let Some(download_path) = outcome.result.path.clone() else {
            tracing::error!(playlist, track = %label, "Downloader reported success without a path");
            track.record_acquisition(outcome.attempts, false, elapsed);
            track.mark_download_failed();
            return track;
        };
        track.record_acquisition(outcome.attempts, true, elapsed);

        let hint = if track.album_url.is_empty() {
            track.source_url.clone()
        } else {
            track.album_url.clone()
        };
        match self.library.add(&download_path, &hint).await {
            Ok(added) if added.imported => {
                tracing::info!(playlist, track = %label, "{}", added.message);
                self.downloads.tidy(&download_path).await;
            }
            Ok(added) => {
                tracing::warn!(playlist, track = %label, path = ?download_path, "Import rejected: {}", added.message);
                track.mark_download_failed();
                return track;
            }
            Err(e) => {
                tracing::error!(playlist, track = %label, path = ?download_path, "Import failed: {}", e);
                track.mark_download_failed();
                return track;
            }
        }

        // The import may have moved and renamed the files.
        match self.library.exists(&LibraryQuery::for_track(&track, true)).await {
            Ok(Some(path)) => track.mark_downloaded(path),
            Ok(None) => {
                tracing::warn!(playlist, track = %label, "Imported but not found in library");
                track.local_path = None;
                track.status = TrackStatus::Downloaded;
            }
            Err(e) => {
                tracing::warn!(playlist, track = %label, "Library lookup after import failed: {}", e);
                track.local_path = None;
                track.status = TrackStatus::Downloaded;
            }
        }
        track
    }
}

fn enter(report: &mut ReconcileReport, state: ReconcileState) {
    tracing::debug!(playlist = %report.playlist, state = state.as_str(), "State");
    report.state = state;
}

//! Core data models for playlist reconciliation.
//!
//! Defines the primary entities: [`Track`], [`PlaylistSnapshot`] and the
//! per-attempt bookkeeping in [`DownloadInfo`] / [`AttemptRecord`].
//!
//! All types are serde-serializable because tracks are persisted verbatim
//! into the per-playlist sync state file. Every field carries a default so
//! state files written by older versions still load.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::matching::QualityTier;

/// Resolution status of a track within a playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    /// Already present in the local library
    FoundInLibrary,
    /// Acquired through a downloader and imported
    Downloaded,
    /// Every downloader in the chain failed for this run
    DownloadFailed,
    /// Missing locally and downloading is disabled for the playlist
    NotAvailable,
    /// Not yet looked up, or looked up and not found (nothing attempted).
    /// Unrecognized stored values (e.g. `unknown`) read back as this.
    #[default]
    #[serde(other)]
    Unresolved,
}

impl TrackStatus {
    /// Convert to string representation for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Unresolved => "unresolved",
            TrackStatus::FoundInLibrary => "found_in_library",
            TrackStatus::Downloaded => "downloaded",
            TrackStatus::DownloadFailed => "download_failed",
            TrackStatus::NotAvailable => "not_available",
        }
    }

    /// Whether this status is allowed to carry a local path.
    pub fn has_local_file(&self) -> bool {
        matches!(self, TrackStatus::FoundInLibrary | TrackStatus::Downloaded)
    }
}

/// Outcome of a single (track, backend) download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Success,
    Failed,
    NotFound,
    RateLimited,
    Timeout,
    Unauthorized,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Success => "success",
            DownloadStatus::Failed => "failed",
            DownloadStatus::NotFound => "not_found",
            DownloadStatus::RateLimited => "rate_limited",
            DownloadStatus::Timeout => "timeout",
            DownloadStatus::Unauthorized => "unauthorized",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DownloadStatus::Success)
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (track, backend) pairing outcome. Append-only within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub backend_name: String,
    pub status: DownloadStatus,
    #[serde(default)]
    pub match_quality: QualityTier,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub elapsed_seconds: f64,
    /// Zero-based retry round this attempt belonged to
    #[serde(default)]
    pub retry_round: u32,
}

/// Download bookkeeping carried on every track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadInfo {
    pub attempted: bool,
    pub successful: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Cumulative number of acquisitions across runs
    pub attempt_count: u32,
    pub downloader_used: Option<String>,
    pub error_message: Option<String>,
    pub match_quality: Option<QualityTier>,
    pub confidence: f32,
    pub download_time_seconds: f64,
    /// Attempt records of the most recent acquisition
    pub attempts: Vec<AttemptRecord>,
}

/// One song instance being reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Track {
    pub title: String,
    /// Primary artist
    pub artist: String,
    pub all_artists: SmallVec<[String; 2]>,
    pub album: String,
    /// Remote album link, used as a search hint when importing downloads
    pub album_url: String,
    /// Upper-cased ISRC, may be empty
    pub isrc: String,
    /// 0 when unknown
    pub release_year: i32,
    pub duration_ms: u64,
    pub track_number: u32,
    /// Link to the track on the origin service
    pub source_url: String,
    /// Identifier on the origin service
    pub service_id: String,
    /// Name of the importer that produced this track
    pub import_source: String,
    pub local_path: Option<PathBuf>,
    pub status: TrackStatus,
    pub download_info: DownloadInfo,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Track {
    fn default() -> Self {
        Self {
            title: String::new(),
            artist: String::new(),
            all_artists: SmallVec::new(),
            album: String::new(),
            album_url: String::new(),
            isrc: String::new(),
            release_year: 0,
            duration_ms: 0,
            track_number: 0,
            source_url: String::new(),
            service_id: String::new(),
            import_source: String::new(),
            local_path: None,
            status: TrackStatus::Unresolved,
            download_info: DownloadInfo::default(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Key used to decide whether two tracks denote the same recording.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackKey {
    Isrc(String),
    ArtistTitle(String, String),
}

impl Track {
    /// Create a track with trimmed metadata and an upper-cased ISRC.
    pub fn new(
        title: impl AsRef<str>,
        artist: impl AsRef<str>,
        album: impl AsRef<str>,
        isrc: impl AsRef<str>,
    ) -> Self {
        let artist = artist.as_ref().trim().to_string();
        let now = Utc::now();
        Self {
            title: title.as_ref().trim().to_string(),
            all_artists: if artist.is_empty() {
                SmallVec::new()
            } else {
                SmallVec::from_elem(artist.clone(), 1)
            },
            artist,
            album: album.as_ref().trim().to_string(),
            isrc: isrc.as_ref().trim().to_uppercase(),
            created_at: Some(now),
            updated_at: Some(now),
            ..Default::default()
        }
    }

    /// Set the release year, clamped to [1900, next year]. Zero means unknown.
    pub fn with_release_year(mut self, year: i32) -> Self {
        self.release_year = clamp_release_year(year);
        self
    }

    /// Whether the ISRC is present.
    pub fn has_isrc(&self) -> bool {
        !self.isrc.is_empty()
    }

    /// Identity key: ISRC when present, else lower-cased artist and title.
    pub fn key(&self) -> TrackKey {
        if self.has_isrc() {
            TrackKey::Isrc(self.isrc.to_uppercase())
        } else {
            self.artist_title_key()
        }
    }

    fn artist_title_key(&self) -> TrackKey {
        TrackKey::ArtistTitle(self.artist.to_lowercase(), self.title.to_lowercase())
    }

    /// Identity equality: equal non-empty ISRCs, otherwise case-insensitive
    /// artist and title.
    pub fn same_identity(&self, other: &Track) -> bool {
        if self.has_isrc() && other.has_isrc() {
            return self.isrc.eq_ignore_ascii_case(&other.isrc);
        }
        self.artist.to_lowercase() == other.artist.to_lowercase()
            && self.title.to_lowercase() == other.title.to_lowercase()
    }

    /// Whether the track already points at a local file.
    pub fn is_resolved(&self) -> bool {
        self.local_path.is_some()
    }

    /// `Artist - Title` label used in logs.
    pub fn label(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }

    /// Mark the track as found in the library at `path`.
    pub fn mark_found_in_library(&mut self, path: impl Into<PathBuf>) {
        self.local_path = Some(path.into());
        self.status = TrackStatus::FoundInLibrary;
        self.touch();
    }

    /// Mark the track as downloaded and imported at `path`.
    pub fn mark_downloaded(&mut self, path: impl Into<PathBuf>) {
        self.local_path = Some(path.into());
        self.status = TrackStatus::Downloaded;
        self.touch();
    }

    /// Mark the track as failed for this run; clears any stale path.
    pub fn mark_download_failed(&mut self) {
        self.local_path = None;
        self.status = TrackStatus::DownloadFailed;
        self.touch();
    }

    /// Mark the track as missing with downloads disabled.
    pub fn mark_not_available(&mut self) {
        self.local_path = None;
        self.status = TrackStatus::NotAvailable;
        self.touch();
    }

    /// Record the outcome of one acquisition (all attempts of one run).
    pub fn record_acquisition(
        &mut self,
        attempts: Vec<AttemptRecord>,
        successful: bool,
        elapsed_seconds: f64,
    ) {
        let info = &mut self.download_info;
        info.attempted = true;
        info.successful = successful;
        info.last_attempt = Some(Utc::now());
        info.attempt_count += 1;
        info.download_time_seconds = elapsed_seconds;
        if let Some(last) = attempts.last() {
            info.downloader_used = Some(last.backend_name.clone());
            info.match_quality = Some(last.match_quality);
            info.confidence = last.confidence;
            info.error_message = if last.status.is_success() {
                None
            } else {
                Some(last.error_message.clone())
            };
        }
        info.attempts = attempts;
        self.touch();
    }

    /// Carry resolution state forward from a previous snapshot's track.
    pub fn inherit_resolution(&mut self, previous: &Track) {
        self.local_path = previous.local_path.clone();
        self.status = previous.status;
        self.download_info = previous.download_info.clone();
        if previous.created_at.is_some() {
            self.created_at = previous.created_at;
        }
    }

    /// Whether the invariant `local_path => found/downloaded` holds.
    pub fn is_consistent(&self) -> bool {
        self.local_path.is_none() || self.status.has_local_file()
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {} [{}]", self.artist, self.title, self.status.as_str())
    }
}

/// Clamp a release year to [1900, next year], keeping 0 as "unknown".
pub fn clamp_release_year(year: i32) -> i32 {
    if year <= 0 {
        return 0;
    }
    let max = Utc::now().year() + 1;
    year.clamp(1900, max)
}

/// Merge a freshly fetched track list with the previously cached one.
///
/// Every fetched track looks for an identity match among the cached tracks
/// (first unconsumed match in cached order) and inherits its path, status and
/// download info. Each cached track is consumed at most once. Lookups go
/// through hash indexes, so the merge is near-linear.
pub fn merge_tracklists(fetched: Vec<Track>, cached: &[Track]) -> Vec<Track> {
    let mut by_isrc: HashMap<String, Vec<usize>> = HashMap::new();
    let mut by_artist_title: HashMap<TrackKey, Vec<usize>> = HashMap::new();
    for (idx, track) in cached.iter().enumerate() {
        if track.has_isrc() {
            by_isrc.entry(track.isrc.to_uppercase()).or_default().push(idx);
        }
        by_artist_title
            .entry(track.artist_title_key())
            .or_default()
            .push(idx);
    }

    let mut consumed = vec![false; cached.len()];
    let first_free = |candidates: Option<&Vec<usize>>,
                      consumed: &[bool],
                      accept: &dyn Fn(&Track) -> bool|
     -> Option<usize> {
        candidates?
            .iter()
            .copied()
            .find(|&idx| !consumed[idx] && accept(&cached[idx]))
    };

    fetched
        .into_iter()
        .map(|mut track| {
            let at_key = track.artist_title_key();
            let found = if track.has_isrc() {
                let by_code = first_free(by_isrc.get(&track.isrc.to_uppercase()), &consumed, &|_| {
                    true
                });
                // Cached tracks without an ISRC can still match on artist/title.
                let by_name = first_free(by_artist_title.get(&at_key), &consumed, &|old| {
                    !old.has_isrc()
                });
                match (by_code, by_name) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            } else {
                first_free(by_artist_title.get(&at_key), &consumed, &|_| true)
            };

            if let Some(idx) = found {
                consumed[idx] = true;
                track.inherit_resolution(&cached[idx]);
            }
            track
        })
        .collect()
}

/// The reconciler's unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistSnapshot {
    /// Stable identifier (remote id or configured name)
    pub id: String,
    pub title: String,
    /// Opaque version token from the remote service
    pub snapshot_id: String,
    pub tracks: Vec<Track>,
    pub description: String,
    pub poster: String,
    pub url: String,
    /// Destinations this playlist should be published to
    pub publish_targets: BTreeSet<String>,
    /// destination -> last published snapshot_id
    pub publish_status: BTreeMap<String, String>,
}

impl PlaylistSnapshot {
    /// Whether `destination` already shows the current snapshot.
    pub fn is_up_to_date_for(&self, destination: &str) -> bool {
        self.publish_status
            .get(destination)
            .is_some_and(|published| *published == self.snapshot_id)
    }

    /// Record that `destination` now shows the current snapshot.
    pub fn mark_published(&mut self, destination: &str) {
        self.publish_status
            .insert(destination.to_string(), self.snapshot_id.clone());
    }

    /// Destinations that have never seen the current snapshot.
    pub fn pending_destinations(&self) -> Vec<String> {
        self.publish_targets
            .iter()
            .filter(|dest| !self.is_up_to_date_for(dest))
            .cloned()
            .collect()
    }

    /// Tracks that point at a local file, in playlist order.
    pub fn resolved_tracks(&self) -> impl Iterator<Item = (&Track, &Path)> {
        self.tracks
            .iter()
            .filter_map(|t| t.local_path.as_deref().map(|p| (t, p)))
    }
}

//! Remote playlist importers.
//!
//! [`PlaylistImporter`] is the seam to music services. [`FileImporter`]
//! reads JSON playlist manifests from disk, which is how playlists exported
//! by other tools are mirrored offline.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use smallvec::SmallVec;

use crate::download_manager::RetryPolicy;
use crate::model::{PlaylistSnapshot, Track};

/// Errors raised while fetching remote playlists.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Playlist not found: {0}")]
    NotFound(String),

    #[error("Authentication failed for {0}")]
    Authentication(String),

    #[error("Rate limited - try again later")]
    RateLimited,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed playlist {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ImportError {
    /// Worth retrying after a backoff delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, ImportError::RateLimited | ImportError::Unavailable(_))
    }
}

/// A fetched playlist. `complete` is false when the service stopped
/// returning tracks before the whole list was read.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPlaylist {
    pub snapshot: PlaylistSnapshot,
    pub complete: bool,
}

/// Which of a user's playlists to list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserPlaylistOptions {
    pub include_collaborative: bool,
    pub include_followed: bool,
}

#[async_trait]
pub trait PlaylistImporter: Send + Sync {
    /// Service name, stored on imported tracks.
    fn name(&self) -> &str;

    /// Fetch one playlist. `limit` caps the number of tracks read.
    async fn get_playlist_tracks(
        &self,
        url: &str,
        limit: Option<usize>,
    ) -> Result<FetchedPlaylist, ImportError>;

    /// List a user's playlists, tracks included.
    async fn get_user_playlists(
        &self,
        user_id: &str,
        options: UserPlaylistOptions,
    ) -> Result<Vec<FetchedPlaylist>, ImportError>;
}

/// Run `op` until it succeeds, fails permanently or `policy` is used up.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, ImportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ImportError>>,
{
    let mut round = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && round + 1 < policy.max_attempts => {
                round += 1;
                let delay = policy.delay_for(round);
                tracing::warn!(
                    what,
                    attempt = round,
                    delay_ms = delay.as_millis() as u64,
                    "Transient import error, backing off: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Manifest {
    id: String,
    title: String,
    snapshot_id: Option<String>,
    description: String,
    poster: String,
    url: String,
    owner: String,
    collaborative: bool,
    /// Tracks the service reported; more than `tracks.len()` means a partial export
    total_tracks: Option<usize>,
    tracks: Vec<ManifestTrack>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ManifestTrack {
    title: String,
    artist: String,
    artists: Vec<String>,
    album: String,
    album_url: String,
    isrc: String,
    release_year: i32,
    duration_ms: u64,
    track_number: u32,
    url: String,
    id: String,
}

/// Importer over JSON manifests in a directory.
///
/// Playlist locations are `file://` URLs, absolute paths, or names relative
/// to the root (`.json` appended when missing). A user's playlists live in
/// `<root>/users/<user_id>/*.json`.
pub struct FileImporter {
    root: PathBuf,
}

impl FileImporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, location: &str) -> PathBuf {
        let raw = location.strip_prefix("file://").unwrap_or(location);
        let path = Path::new(raw);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let mut path = self.root.join(raw);
        if path.extension().is_none() {
            path.set_extension("json");
        }
        path
    }

    async fn read_manifest(&self, path: &Path) -> Result<Manifest, ImportError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImportError::NotFound(path.display().to_string()));
            }
            Err(source) => {
                return Err(ImportError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&text).map_err(|source| ImportError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn to_fetched(&self, manifest: Manifest, path: &Path, limit: Option<usize>) -> FetchedPlaylist {
        let reported = manifest.total_tracks.unwrap_or(manifest.tracks.len());
        let mut tracks: Vec<Track> = manifest
            .tracks
            .into_iter()
            .map(|t| self.to_track(t))
            .collect();
        let mut complete = tracks.len() >= reported;
        if let Some(limit) = limit
            && tracks.len() > limit
        {
            tracks.truncate(limit);
            complete = false;
        }

        let id = if manifest.id.is_empty() {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            manifest.id
        };
        let snapshot_id = manifest
            .snapshot_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| derive_snapshot_id(&tracks));
        let url = if manifest.url.is_empty() {
            format!("file://{}", path.display())
        } else {
            manifest.url
        };

        FetchedPlaylist {
            snapshot: PlaylistSnapshot {
                title: if manifest.title.is_empty() {
                    id.clone()
                } else {
                    manifest.title
                },
                id,
                snapshot_id,
                tracks,
                description: manifest.description,
                poster: manifest.poster,
                url,
                ..Default::default()
            },
            complete,
        }
    }

    fn to_track(&self, raw: ManifestTrack) -> Track {
        let mut track = Track::new(&raw.title, &raw.artist, &raw.album, &raw.isrc)
            .with_release_year(raw.release_year);
        if !raw.artists.is_empty() {
            track.all_artists = raw.artists.into_iter().collect::<SmallVec<_>>();
        }
        track.album_url = raw.album_url;
        track.duration_ms = raw.duration_ms;
        track.track_number = raw.track_number;
        track.source_url = raw.url;
        track.service_id = raw.id;
        track.import_source = self.name().to_string();
        track
    }
}

/// Version token for a track list: SHA-256 over each track's identity.
pub fn derive_snapshot_id(tracks: &[Track]) -> String {
    let mut hasher = Sha256::new();
    for track in tracks {
        hasher.update(track.isrc.as_bytes());
        hasher.update(b"|");
        hasher.update(track.artist.to_lowercase().as_bytes());
        hasher.update(b"|");
        hasher.update(track.title.to_lowercase().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl PlaylistImporter for FileImporter {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_playlist_tracks(
        &self,
        url: &str,
        limit: Option<usize>,
    ) -> Result<FetchedPlaylist, ImportError> {
        let path = self.resolve(url);
        let manifest = self.read_manifest(&path).await?;
        let fetched = self.to_fetched(manifest, &path, limit);
        tracing::debug!(
            playlist = %fetched.snapshot.title,
            tracks = fetched.snapshot.tracks.len(),
            complete = fetched.complete,
            "Read playlist manifest"
        );
        Ok(fetched)
    }

    async fn get_user_playlists(
        &self,
        user_id: &str,
        options: UserPlaylistOptions,
    ) -> Result<Vec<FetchedPlaylist>, ImportError> {
        let dir = self.root.join("users").join(user_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImportError::NotFound(format!("user {user_id}")));
            }
            Err(source) => return Err(ImportError::Read { path: dir, source }),
        };

        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().is_some_and(|e| e == "json") {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(source) => return Err(ImportError::Read { path: dir, source }),
            }
        }
        paths.sort();

        let mut playlists = Vec::with_capacity(paths.len());
        for path in paths {
            let manifest = match self.read_manifest(&path).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(user = user_id, path = ?path, "Skipping playlist: {}", e);
                    continue;
                }
            };
            if manifest.collaborative && !options.include_collaborative {
                continue;
            }
            let followed = !manifest.owner.is_empty() && manifest.owner != user_id;
            if followed && !options.include_followed {
                continue;
            }
            playlists.push(self.to_fetched(manifest, &path, None));
        }
        Ok(playlists)
    }
}

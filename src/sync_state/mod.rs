//! Per-playlist sync state, one JSON file per playlist.
//!
//! Files are written to a temporary name and renamed into place, and read
//! leniently: missing fields take their defaults and unknown ones are
//! ignored. A playlist is reconciled by at most one task at a time; see
//! [`SyncStateStore::try_lock`].

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::model::PlaylistSnapshot;
use crate::organizer;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Playlist '{0}' is already being synced")]
    Busy(String),

    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state for '{id}': {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Held while a playlist is being reconciled. Released on drop.
#[derive(Debug)]
pub struct PlaylistLock {
    id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl PlaylistLock {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for PlaylistLock {
    fn drop(&mut self) {
        self.active.lock().remove(&self.id);
    }
}

/// Directory of sync state files.
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    dir: PathBuf,
    active: Arc<Mutex<HashSet<String>>>,
}

impl SyncStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claim `id` for reconciliation. Fails with [`StateError::Busy`] while
    /// another holder exists.
    pub fn try_lock(&self, id: &str) -> Result<PlaylistLock, StateError> {
        let mut active = self.active.lock();
        if !active.insert(id.to_string()) {
            return Err(StateError::Busy(id.to_string()));
        }
        Ok(PlaylistLock {
            id: id.to_string(),
            active: self.active.clone(),
        })
    }

    /// State file for `id`: a readable prefix plus a digest, so distinct ids
    /// never collide after sanitizing.
    pub fn path_for(&self, id: &str) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(id.as_bytes()));
        let prefix = organizer::sanitize_component(id, 48);
        self.dir.join(format!("{}-{}.json", prefix, &digest[..16]))
    }

    /// Load the cached snapshot for `id`. A missing file is `None`; a file
    /// that no longer parses is logged and treated as missing.
    pub async fn load(&self, id: &str) -> Result<Option<PlaylistSnapshot>, StateError> {
        let path = self.path_for(id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StateError::Read { path, source }),
        };
        match serde_json::from_str(&text) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(playlist = id, path = ?path, "Ignoring unreadable sync state: {}", e);
                Ok(None)
            }
        }
    }

    /// Replace the stored snapshot for `id`.
    pub async fn save(&self, id: &str, snapshot: &PlaylistSnapshot) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(snapshot).map_err(|source| StateError::Serialize {
            id: id.to_string(),
            source,
        })?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StateError::Write {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| StateError::Write {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StateError::Write { path, source })?;
        Ok(())
    }

    /// Every stored snapshot, for status reports.
    pub async fn list(&self) -> Result<Vec<PlaylistSnapshot>, StateError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StateError::Read {
            path: self.dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => match serde_json::from_str::<PlaylistSnapshot>(&text) {
                    Ok(snapshot) => snapshots.push(snapshot),
                    Err(e) => tracing::warn!(path = ?path, "Skipping unreadable sync state: {}", e),
                },
                Err(e) => tracing::warn!(path = ?path, "Skipping unreadable sync state: {}", e),
            }
        }
        snapshots.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(snapshots)
    }
}

//! Playlist publishing.
//!
//! [`PlaylistPublisher`] is the seam to media servers. [`M3uPublisher`]
//! writes extended M3U files, one directory per destination.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::config::COLLECTION_DESTINATION;
use crate::error::{Error, Result, ResultExt};
use crate::model::PlaylistSnapshot;
use crate::organizer::{self, MAX_COMPONENT_CHARS};

/// Outcome of [`PlaylistPublisher::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub published: bool,
    pub message: String,
}

#[async_trait]
pub trait PlaylistPublisher: Send + Sync {
    /// Publish `snapshot` to `destination`, as a playlist or as a collection.
    async fn publish(
        &self,
        snapshot: &PlaylistSnapshot,
        destination: &str,
        as_collection: bool,
    ) -> Result<PublishOutcome>;
}

/// Writes `<root>/<destination>/<title>.m3u`, or
/// `<root>/collections/<title>.m3u` for collections.
pub struct M3uPublisher {
    root: PathBuf,
}

impl M3uPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn playlist_path(&self, title: &str, destination: &str, as_collection: bool) -> PathBuf {
        let dir = if as_collection {
            COLLECTION_DESTINATION
        } else {
            destination
        };
        let file = format!("{}.m3u", organizer::sanitize_component(title, MAX_COMPONENT_CHARS));
        self.root
            .join(organizer::sanitize_component(dir, MAX_COMPONENT_CHARS))
            .join(file)
    }
}

/// Extended M3U body for the resolved tracks of `snapshot`.
pub fn render_m3u(snapshot: &PlaylistSnapshot) -> String {
    let mut out = String::from("#EXTM3U\n");
    if !snapshot.title.is_empty() {
        let _ = writeln!(out, "#PLAYLIST:{}", snapshot.title);
    }
    for (track, path) in snapshot.resolved_tracks() {
        let secs = if track.duration_ms == 0 {
            -1
        } else {
            (track.duration_ms / 1000) as i64
        };
        let _ = writeln!(out, "#EXTINF:{},{} - {}", secs, track.artist, track.title);
        let _ = writeln!(out, "{}", path.display());
    }
    out
}

async fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(format!("creating {:?}", parent))?;
    }
    let tmp = path.with_extension("m3u.tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(format!("writing {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(format!("replacing {:?}", path))
}

#[async_trait]
impl PlaylistPublisher for M3uPublisher {
    async fn publish(
        &self,
        snapshot: &PlaylistSnapshot,
        destination: &str,
        as_collection: bool,
    ) -> Result<PublishOutcome> {
        if snapshot.title.trim().is_empty() {
            return Err(Error::publish(format!("playlist '{}' has no title", snapshot.id)));
        }
        let path = self.playlist_path(&snapshot.title, destination, as_collection);
        let body = render_m3u(snapshot);
        write_atomically(&path, &body).await?;

        let count = snapshot.resolved_tracks().count();
        Ok(PublishOutcome {
            published: true,
            message: format!("wrote {} of {} tracks to {}", count, snapshot.tracks.len(), path.display()),
        })
    }
}

/// Mock publisher for testing.
#[cfg(test)]
pub mod mocks {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Records every call; destinations in `failing` return an error.
    #[derive(Default)]
    pub struct MockPublisher {
        /// (playlist title, destination, as_collection, snapshot_id)
        pub calls: Mutex<Vec<(String, String, bool, String)>>,
        pub failing: Mutex<HashSet<String>>,
    }

    impl MockPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_for(self, destination: &str) -> Self {
            self.failing.lock().insert(destination.to_string());
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        pub fn destinations(&self) -> Vec<String> {
            self.calls.lock().iter().map(|c| c.1.clone()).collect()
        }
    }

    #[async_trait]
    impl PlaylistPublisher for MockPublisher {
        async fn publish(
            &self,
            snapshot: &PlaylistSnapshot,
            destination: &str,
            as_collection: bool,
        ) -> Result<PublishOutcome> {
            self.calls.lock().push((
                snapshot.title.clone(),
                destination.to_string(),
                as_collection,
                snapshot.snapshot_id.clone(),
            ));
            if self.failing.lock().contains(destination) {
                return Err(Error::publish(format!("{destination} unreachable")));
            }
            Ok(PublishOutcome {
                published: true,
                message: "ok".into(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Track;
    use tempfile::TempDir;

    fn snapshot() -> PlaylistSnapshot {
        let mut found = Track::new("One More Time", "Daft Punk", "Discovery", "");
        found.duration_ms = 320_500;
        found.mark_found_in_library("/music/Daft Punk/Discovery/01 - One More Time.flac");
        let missing = Track::new("Missing", "Nobody", "", "");
        PlaylistSnapshot {
            id: "p1".into(),
            title: "Road Trip".into(),
            snapshot_id: "s1".into(),
            tracks: vec![found, missing],
            ..Default::default()
        }
    }

    #[test]
    fn test_render_m3u_lists_resolved_tracks() {
        let body = render_m3u(&snapshot());
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(
            lines,
            vec![
                "#EXTM3U",
                "#PLAYLIST:Road Trip",
                "#EXTINF:320,Daft Punk - One More Time",
                "/music/Daft Punk/Discovery/01 - One More Time.flac",
            ]
        );
    }

    #[tokio::test]
    async fn test_publish_writes_per_destination() {
        let dir = TempDir::new().unwrap();
        let publisher = M3uPublisher::new(dir.path());

        let outcome = publisher.publish(&snapshot(), "alice", false).await.unwrap();
        assert!(outcome.published);
        assert!(outcome.message.contains("1 of 2"));
        assert!(dir.path().join("alice").join("Road Trip.m3u").exists());

        publisher.publish(&snapshot(), "alice", true).await.unwrap();
        assert!(dir.path().join("collections").join("Road Trip.m3u").exists());
    }

    #[tokio::test]
    async fn test_publish_sanitizes_names() {
        let dir = TempDir::new().unwrap();
        let publisher = M3uPublisher::new(dir.path());
        let mut snap = snapshot();
        snap.title = "Rock/Metal: Best?".into();

        publisher.publish(&snap, "m3u", false).await.unwrap();
        assert!(dir.path().join("m3u").join("Rock_Metal_ Best_.m3u").exists());
    }

    #[tokio::test]
    async fn test_publish_requires_title() {
        let dir = TempDir::new().unwrap();
        let mut snap = snapshot();
        snap.title.clear();
        assert!(M3uPublisher::new(dir.path()).publish(&snap, "m3u", false).await.is_err());
    }
}

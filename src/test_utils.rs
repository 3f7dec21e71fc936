//! Test fixtures shared across modules.
//!
//! ```ignore
//! use crate::test_utils::{snapshot_of, track};
//!
//! let snap = snapshot_of("s1", vec![track("USRC12345678", "Artist", "Song")]);
//! ```

use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;

use crate::metadata::TrackMetadata;
use crate::model::{PlaylistSnapshot, Track};

/// Creates a migrated catalog database in a temporary directory.
///
/// Keep the `TempDir` alive for the duration of the test.
pub async fn temp_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let db_url = crate::db::db_url(&dir.path().join("test.db"));

    let pool = crate::db::init_db(&db_url)
        .await
        .expect("Failed to initialize test database");

    (pool, dir)
}

/// Tag metadata with sensible defaults. Customize with struct update syntax.
pub fn mock_track_metadata() -> TrackMetadata {
    TrackMetadata {
        title: "Song".to_string(),
        artist: "Artist".to_string(),
        album: "Album".to_string(),
        year: Some(2020),
        isrc: Some("USRC12345678".to_string()),
        duration: 180,
        track_number: Some(1),
    }
}

/// A playlist track on album "Album" with no release year.
pub fn track(isrc: &str, artist: &str, title: &str) -> Track {
    Track::new(title, artist, "Album", isrc)
}

/// A complete snapshot titled "Hits" holding `tracks`.
pub fn snapshot_of(snapshot_id: &str, tracks: Vec<Track>) -> PlaylistSnapshot {
    PlaylistSnapshot {
        id: "hits".into(),
        title: "Hits".into(),
        snapshot_id: snapshot_id.into(),
        tracks,
        ..Default::default()
    }
}

/// Records a catalog row for `path` and returns its id.
pub async fn insert_mock_track(pool: &SqlitePool, meta: &TrackMetadata, path: &str) -> i64 {
    crate::db::upsert_file(pool, meta, path)
        .await
        .expect("Failed to insert track")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_mock_track_is_findable_by_isrc() {
        let (pool, _dir) = temp_db().await;

        let id = insert_mock_track(&pool, &mock_track_metadata(), "/music/song.flac").await;
        assert!(id > 0);

        let entry = crate::db::find_by_isrc(&pool, "USRC12345678")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.path, "/music/song.flac");
        assert_eq!(crate::db::count_tracks(&pool).await.unwrap(), 1);
    }

    #[test]
    fn test_track_fixture_defaults() {
        let t = track("usrc12345678", "Artist", "Song");
        assert_eq!(t.album, "Album");
        assert_eq!(t.isrc, "USRC12345678");
        assert!(!t.is_resolved());
    }

    #[test]
    fn test_snapshot_fixture() {
        let snap = snapshot_of("s1", vec![track("", "A", "T")]);
        assert_eq!(snap.title, "Hits");
        assert_eq!(snap.tracks.len(), 1);
        assert!(snap.publish_targets.is_empty());
    }
}

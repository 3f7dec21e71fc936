//! Database module for the local library catalog.
//!
//! Uses SQLx with SQLite for lightweight, embedded database storage.
//! Provides async operations for:
//! - Track upserts keyed by file path
//! - Artist and album management
//! - ISRC and artist/title lookups used by the library index
//!
//! # Example
//!
//! ```ignore
//! use playlist_warden::db::{init_db, find_by_isrc};
//!
//! let pool = init_db("sqlite:library.db").await?;
//! let hit = find_by_isrc(&pool, "USRC12345678").await?;
//! ```

use std::path::PathBuf;

use crate::metadata::TrackMetadata;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Maximum rows returned by a fuzzy search.
const SEARCH_LIMIT: i64 = 20;

/// Build a SQLite database URL from a path.
pub fn db_url(path: &std::path::Path) -> String {
    format!("sqlite:{}", path.display())
}

/// Initialize the database connection pool and run migrations.
///
/// Creates the database file if it doesn't exist, establishes a connection
/// pool with up to 5 connections, and runs all pending migrations.
///
/// # Errors
///
/// Returns an error if:
/// - Database creation fails
/// - Connection cannot be established
/// - Migration fails
pub async fn init_db(db_url: &str) -> Result<SqlitePool, sqlx::Error> {
    if !sqlx::Sqlite::database_exists(db_url).await.unwrap_or(false) {
        sqlx::Sqlite::create_database(db_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Get or create an artist by name.
///
/// Idempotent: calling with the same name always returns the same ID, also
/// when several callers race on a new name.
pub async fn get_or_create_artist(pool: &SqlitePool, name: &str) -> sqlx::Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO artists (name) VALUES (?)
        ON CONFLICT(name) DO UPDATE SET name = excluded.name
        RETURNING id
        "#,
    )
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Get or create an album by title and artist.
///
/// A known year fills in a previously unknown one. Uniqueness is enforced by
/// `idx_albums_title_artist`, so concurrent callers settle on one row.
pub async fn get_or_create_album(
    pool: &SqlitePool,
    title: &str,
    artist_id: Option<i64>,
    year: Option<i32>,
) -> sqlx::Result<i64> {
    sqlx::query("INSERT OR IGNORE INTO albums (title, artist_id, year) VALUES (?, ?, ?)")
        .bind(title)
        .bind(artist_id)
        .bind(year)
        .execute(pool)
        .await?;

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM albums WHERE title = ? AND artist_id IS ?")
        .bind(title)
        .bind(artist_id)
        .fetch_one(pool)
        .await?;

    if year.is_some() {
        sqlx::query("UPDATE albums SET year = COALESCE(year, ?) WHERE id = ?")
            .bind(year)
            .bind(id)
            .execute(pool)
            .await?;
    }
    Ok(id)
}

/// Insert or update a track record keyed by file path.
pub async fn insert_track(
    pool: &SqlitePool,
    meta: &TrackMetadata,
    path: &str,
    artist_id: Option<i64>,
    album_id: Option<i64>,
) -> sqlx::Result<i64> {
    let duration = meta.duration as i64;
    let track_number = meta.track_number.map(|n| n as i64);

    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO tracks (title, artist_id, album_id, path, duration, track_number, isrc)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            title = excluded.title,
            artist_id = excluded.artist_id,
            album_id = excluded.album_id,
            duration = excluded.duration,
            track_number = excluded.track_number,
            isrc = excluded.isrc
        RETURNING id
        "#,
    )
    .bind(&meta.title)
    .bind(artist_id)
    .bind(album_id)
    .bind(path)
    .bind(duration)
    .bind(track_number)
    .bind(meta.isrc.as_deref())
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Record a file with its metadata, creating artist and album rows as needed.
pub async fn upsert_file(pool: &SqlitePool, meta: &TrackMetadata, path: &str) -> sqlx::Result<i64> {
    let artist_id = if meta.artist.is_empty() {
        None
    } else {
        Some(get_or_create_artist(pool, &meta.artist).await?)
    };
    let album_id = if meta.album.is_empty() {
        None
    } else {
        Some(get_or_create_album(pool, &meta.album, artist_id, meta.year).await?)
    };
    insert_track(pool, meta, path, artist_id, album_id).await
}

/// Remove a track record by path. Returns whether a row was deleted.
pub async fn delete_track_by_path(pool: &SqlitePool, path: &str) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM tracks WHERE path = ?")
        .bind(path)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Catalog row with joined artist and album names.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CatalogEntry {
    /// Database ID
    pub id: i64,
    /// Track title
    pub title: String,
    /// File path
    pub path: String,
    /// Duration in seconds
    pub duration: Option<i64>,
    /// Track number on album
    pub track_number: Option<i64>,
    /// Upper-cased ISRC
    pub isrc: Option<String>,
    /// Artist name (empty when untagged)
    pub artist_name: String,
    /// Album name (empty when untagged)
    pub album_name: String,
    /// Release year (from album)
    pub year: Option<i64>,
}

impl CatalogEntry {
    /// Convert the path string to a PathBuf.
    pub fn path_buf(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

const ENTRY_SELECT: &str = r#"
    SELECT
        t.id, t.title, t.path, t.duration, t.track_number, t.isrc,
        COALESCE(a.name, '') as artist_name,
        COALESCE(al.title, '') as album_name,
        al.year
    FROM tracks t
    LEFT JOIN artists a ON t.artist_id = a.id
    LEFT JOIN albums al ON t.album_id = al.id
"#;

/// Find a track by exact (case-insensitive) ISRC.
pub async fn find_by_isrc(pool: &SqlitePool, isrc: &str) -> sqlx::Result<Option<CatalogEntry>> {
    let sql = format!("{ENTRY_SELECT} WHERE UPPER(t.isrc) = UPPER(?) ORDER BY t.id LIMIT 1");
    sqlx::query_as::<_, CatalogEntry>(&sql)
        .bind(isrc)
        .fetch_optional(pool)
        .await
}

/// Case-insensitive substring search on artist and title, optionally album.
pub async fn search(
    pool: &SqlitePool,
    artist: &str,
    title: &str,
    album: Option<&str>,
) -> sqlx::Result<Vec<CatalogEntry>> {
    let sql = format!(
        r#"{ENTRY_SELECT}
        WHERE instr(LOWER(COALESCE(a.name, '')), LOWER(?)) > 0
          AND instr(LOWER(t.title), LOWER(?)) > 0
          AND (? IS NULL OR instr(LOWER(COALESCE(al.title, '')), LOWER(?)) > 0)
        ORDER BY t.id
        LIMIT ?"#
    );
    sqlx::query_as::<_, CatalogEntry>(&sql)
        .bind(artist)
        .bind(title)
        .bind(album)
        .bind(album)
        .bind(SEARCH_LIMIT)
        .fetch_all(pool)
        .await
}

/// All (ISRC, path) pairs, used to warm the lookup cache.
pub async fn all_isrc_paths(pool: &SqlitePool) -> sqlx::Result<Vec<(String, String)>> {
    sqlx::query_as("SELECT UPPER(isrc), path FROM tracks WHERE isrc IS NOT NULL AND isrc != ''")
        .fetch_all(pool)
        .await
}

/// All catalogued file paths.
pub async fn all_paths(pool: &SqlitePool) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT path FROM tracks")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(p,)| p).collect())
}

/// Number of catalogued tracks.
pub async fn count_tracks(pool: &SqlitePool) -> sqlx::Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tracks")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let pool = init_db(&db_url(&db_path)).await.expect("Failed to init db");
        (temp_dir, pool)
    }

    fn meta(title: &str, artist: &str, album: &str, isrc: Option<&str>) -> TrackMetadata {
        TrackMetadata {
            title: title.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
            isrc: isrc.map(str::to_string),
            year: Some(2001),
            duration: 180,
            track_number: Some(1),
        }
    }

    #[tokio::test]
    async fn test_init_db_creates_database() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let pool = init_db(&db_url(&db_path)).await.expect("Failed to init db");
        assert!(db_path.exists());
        assert_eq!(count_tracks(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_artist_creation_and_retrieval() {
        let (_dir, pool) = test_pool().await;

        let id1 = get_or_create_artist(&pool, "Test Artist").await.unwrap();
        assert!(id1 > 0);

        let id2 = get_or_create_artist(&pool, "Test Artist").await.unwrap();
        assert_eq!(id1, id2);

        let id3 = get_or_create_artist(&pool, "Another Artist").await.unwrap();
        assert_ne!(id1, id3);
    }

    #[tokio::test]
    async fn test_album_fills_unknown_year() {
        let (_dir, pool) = test_pool().await;
        let artist_id = get_or_create_artist(&pool, "Artist").await.unwrap();

        let id1 = get_or_create_album(&pool, "Album", Some(artist_id), None)
            .await
            .unwrap();
        let id2 = get_or_create_album(&pool, "Album", Some(artist_id), Some(1999))
            .await
            .unwrap();
        assert_eq!(id1, id2);

        let (year,): (Option<i64>,) = sqlx::query_as("SELECT year FROM albums WHERE id = ?")
            .bind(id1)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(year, Some(1999));
    }

    #[tokio::test]
    async fn test_album_without_artist_is_shared() {
        let (_dir, pool) = test_pool().await;
        let id1 = get_or_create_album(&pool, "Compilation", None, None).await.unwrap();
        let id2 = get_or_create_album(&pool, "Compilation", None, Some(2004)).await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_share_artist_and_album() {
        let (_dir, pool) = test_pool().await;

        let writes = (0..16).map(|i| {
            let pool = pool.clone();
            async move {
                let path = format!("/m/Artist/Album/{i:02}.flac");
                upsert_file(&pool, &meta(&format!("Song {i}"), "Artist", "Album", None), &path).await
            }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        let artists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM artists")
            .fetch_one(&pool)
            .await
            .unwrap();
        let albums: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM albums")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(artists.0, 1);
        assert_eq!(albums.0, 1);
        assert_eq!(count_tracks(&pool).await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_by_path() {
        let (_dir, pool) = test_pool().await;

        let id1 = upsert_file(&pool, &meta("Song", "Artist", "Album", None), "/m/a.mp3")
            .await
            .unwrap();
        let id2 = upsert_file(
            &pool,
            &meta("Song (Remaster)", "Artist", "Album", Some("USRC12345678")),
            "/m/a.mp3",
        )
        .await
        .unwrap();

        assert_eq!(id1, id2);
        assert_eq!(count_tracks(&pool).await.unwrap(), 1);
        let hit = find_by_isrc(&pool, "usrc12345678").await.unwrap().unwrap();
        assert_eq!(hit.title, "Song (Remaster)");
    }

    #[tokio::test]
    async fn test_find_by_isrc() {
        let (_dir, pool) = test_pool().await;
        upsert_file(
            &pool,
            &meta("One More Time", "Daft Punk", "Discovery", Some("GBDUW0000059")),
            "/m/omt.flac",
        )
        .await
        .unwrap();

        let hit = find_by_isrc(&pool, "GBDUW0000059").await.unwrap().unwrap();
        assert_eq!(hit.path_buf(), PathBuf::from("/m/omt.flac"));
        assert_eq!(hit.artist_name, "Daft Punk");
        assert_eq!(hit.year, Some(2001));

        assert!(find_by_isrc(&pool, "NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_substring_case_insensitive() {
        let (_dir, pool) = test_pool().await;
        upsert_file(&pool, &meta("One More Time", "Daft Punk", "Discovery", None), "/m/1.mp3")
            .await
            .unwrap();
        upsert_file(&pool, &meta("Aerodynamic", "Daft Punk", "Discovery", None), "/m/2.mp3")
            .await
            .unwrap();

        let hits = search(&pool, "daft punk", "one more", None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/m/1.mp3");

        let with_album = search(&pool, "daft", "aero", Some("discovery")).await.unwrap();
        assert_eq!(with_album.len(), 1);

        let wrong_album = search(&pool, "daft", "aero", Some("homework")).await.unwrap();
        assert!(wrong_album.is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_list_paths() {
        let (_dir, pool) = test_pool().await;
        upsert_file(&pool, &meta("A", "X", "Y", Some("AAA")), "/m/a.mp3")
            .await
            .unwrap();
        upsert_file(&pool, &meta("B", "X", "Y", None), "/m/b.mp3")
            .await
            .unwrap();

        assert_eq!(
            all_isrc_paths(&pool).await.unwrap(),
            vec![("AAA".to_string(), "/m/a.mp3".to_string())]
        );
        assert!(delete_track_by_path(&pool, "/m/a.mp3").await.unwrap());
        assert!(!delete_track_by_path(&pool, "/m/a.mp3").await.unwrap());
        assert_eq!(all_paths(&pool).await.unwrap(), vec!["/m/b.mp3".to_string()]);
    }
}

//! Library index: "is this track already local?" and "import this download".
//!
//! [`LibraryIndex`] is the seam the reconciler talks to. [`CatalogLibrary`]
//! is the SQLite-backed implementation over the organized music directory.

mod catalog;

pub use catalog::{CatalogLibrary, ScanEvent, ScanSummary};

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::Track;

/// Lookup parameters for [`LibraryIndex::exists`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LibraryQuery {
    pub isrc: Option<String>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    /// Fall back to artist/title(/album) when the ISRC lookup misses
    pub allow_fuzzy: bool,
}

impl LibraryQuery {
    /// Query for `track`, using every identifying field it has.
    pub fn for_track(track: &Track, allow_fuzzy: bool) -> Self {
        let non_empty = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        Self {
            isrc: non_empty(&track.isrc),
            artist: non_empty(&track.artist),
            title: non_empty(&track.title),
            album: non_empty(&track.album),
            allow_fuzzy,
        }
    }
}

/// Result of [`LibraryIndex::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// At least one file was imported
    pub imported: bool,
    pub message: String,
}

/// The local library as seen by the reconciler.
///
/// `add` is not safe to call twice for the same content; callers must not
/// import a track that is already in the library.
#[async_trait]
pub trait LibraryIndex: Send + Sync {
    /// Path of a matching local file, if any.
    async fn exists(&self, query: &LibraryQuery) -> Result<Option<PathBuf>>;

    /// Import downloaded content at `path`. `search_hint` is a
    /// service-specific locator (e.g. the remote album URL).
    async fn add(&self, path: &Path, search_hint: &str) -> Result<AddOutcome>;
}

/// Mock library index for testing.
#[cfg(test)]
pub mod mocks {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory library keyed by ISRC and lower-cased "artist|title".
    #[derive(Default)]
    pub struct MockLibrary {
        by_isrc: Mutex<HashMap<String, PathBuf>>,
        by_name: Mutex<HashMap<String, PathBuf>>,
        /// Paths passed to `add`, in call order
        pub added: Mutex<Vec<PathBuf>>,
        pub exists_calls: AtomicUsize,
        pub add_calls: AtomicUsize,
        /// When set, `add` registers the import under this ISRC
        pub import_as_isrc: Mutex<Option<String>>,
        /// When set, `add` reports failure
        pub fail_add: bool,
    }

    impl MockLibrary {
        pub fn new() -> Self {
            Self::default()
        }

        fn name_key(artist: &str, title: &str) -> String {
            format!("{}|{}", artist.to_lowercase(), title.to_lowercase())
        }

        /// Pre-populate a track reachable by ISRC.
        pub fn with_isrc(self, isrc: &str, path: impl Into<PathBuf>) -> Self {
            self.by_isrc.lock().insert(isrc.to_uppercase(), path.into());
            self
        }

        /// Pre-populate a track reachable by artist/title.
        pub fn with_name(self, artist: &str, title: &str, path: impl Into<PathBuf>) -> Self {
            self.by_name
                .lock()
                .insert(Self::name_key(artist, title), path.into());
            self
        }

        pub fn exists_count(&self) -> usize {
            self.exists_calls.load(Ordering::SeqCst)
        }

        pub fn add_count(&self) -> usize {
            self.add_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LibraryIndex for MockLibrary {
        async fn exists(&self, query: &LibraryQuery) -> Result<Option<PathBuf>> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(isrc) = &query.isrc
                && let Some(path) = self.by_isrc.lock().get(&isrc.to_uppercase())
            {
                return Ok(Some(path.clone()));
            }
            if query.allow_fuzzy
                && let (Some(artist), Some(title)) = (&query.artist, &query.title)
            {
                return Ok(self.by_name.lock().get(&Self::name_key(artist, title)).cloned());
            }
            Ok(None)
        }

        async fn add(&self, path: &Path, _search_hint: &str) -> Result<AddOutcome> {
            self.add_calls.fetch_add(1, Ordering::SeqCst);
            self.added.lock().push(path.to_path_buf());
            if self.fail_add {
                return Ok(AddOutcome {
                    imported: false,
                    message: "mock import rejected".into(),
                });
            }
            let imported_path = PathBuf::from("/library").join(
                path.file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_default(),
            );
            if let Some(isrc) = self.import_as_isrc.lock().clone() {
                self.by_isrc.lock().insert(isrc, imported_path);
            }
            Ok(AddOutcome {
                imported: true,
                message: "imported 1 file".into(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_for_track_skips_empty_fields() {
        let track = Track::new("Song", "Artist", "", "");
        let q = LibraryQuery::for_track(&track, true);
        assert_eq!(q.isrc, None);
        assert_eq!(q.album, None);
        assert_eq!(q.artist.as_deref(), Some("Artist"));
        assert!(q.allow_fuzzy);
    }

    #[tokio::test]
    async fn test_mock_library_respects_fuzzy_flag() {
        let lib = mocks::MockLibrary::new().with_name("Artist", "Song", "/m/song.mp3");
        let track = Track::new("Song", "Artist", "", "");

        let strict = lib.exists(&LibraryQuery::for_track(&track, false)).await.unwrap();
        assert!(strict.is_none());
        let fuzzy = lib.exists(&LibraryQuery::for_track(&track, true)).await.unwrap();
        assert_eq!(fuzzy, Some(PathBuf::from("/m/song.mp3")));
    }
}

//! SQLite catalog of the organized music directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::RwLock;
use rayon::prelude::*;
use sqlx::SqlitePool;
use walkdir::WalkDir;

use super::{AddOutcome, LibraryIndex, LibraryQuery};
use crate::config::LibraryConfig;
use crate::db;
use crate::error::{Error, Result, ResultExt};
use crate::matching::{self, Candidate};
use crate::metadata::{self, TrackMetadata};
use crate::model::Track;
use crate::organizer;

/// Outcome of processing one file during a scan.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Processed(PathBuf),
    Error(PathBuf, String),
}

/// Totals of a [`CatalogLibrary::scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub processed: usize,
    pub errors: usize,
    /// Rows removed because their file disappeared
    pub pruned: usize,
}

/// Library index backed by the SQLite catalog.
pub struct CatalogLibrary {
    pool: SqlitePool,
    music_dir: PathBuf,
    pattern: String,
    /// Minimum matcher score for an artist/title hit to count
    min_fuzzy_confidence: f32,
    /// ISRC -> path, warmed from the catalog
    isrc_cache: RwLock<HashMap<String, PathBuf>>,
}

impl CatalogLibrary {
    /// Open (or create) the catalog described by `config`.
    pub async fn open(config: &LibraryConfig, min_fuzzy_confidence: f32) -> Result<Self> {
        if let Some(dir) = config.database.parent() {
            std::fs::create_dir_all(dir).with_context(format!("creating {:?}", dir))?;
        }
        let pool = db::init_db(&db::db_url(&config.database))
            .await
            .with_context("opening library catalog")?;
        Self::with_pool(pool, config, min_fuzzy_confidence).await
    }

    /// Build on an existing pool.
    pub async fn with_pool(
        pool: SqlitePool,
        config: &LibraryConfig,
        min_fuzzy_confidence: f32,
    ) -> Result<Self> {
        let library = Self {
            pool,
            music_dir: config.music_dir.clone(),
            pattern: config.path_pattern.clone(),
            min_fuzzy_confidence,
            isrc_cache: RwLock::new(HashMap::new()),
        };
        library.warm_cache().await?;
        Ok(library)
    }

    pub fn music_dir(&self) -> &Path {
        &self.music_dir
    }

    async fn warm_cache(&self) -> Result<()> {
        let rows = db::all_isrc_paths(&self.pool)
            .await
            .with_context("loading ISRC cache")?;
        let mut cache = self.isrc_cache.write();
        cache.clear();
        cache.extend(rows.into_iter().map(|(isrc, path)| (isrc, PathBuf::from(path))));
        tracing::debug!(entries = cache.len(), "ISRC cache warmed");
        Ok(())
    }

    /// Rebuild the catalog from the files under `root`.
    ///
    /// Tags are read in parallel; rows whose files vanished are pruned.
    pub async fn scan(&self, root: &Path) -> Result<ScanSummary> {
        let root = root.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || read_tree(&root))
            .await
            .map_err(|e| Error::library(format!("scan task failed: {e}")))?;

        let pool = self.pool.clone();
        let events: Vec<ScanEvent> = stream::iter(entries)
            .map(|(path, meta)| {
                let pool = pool.clone();
                async move {
                    let Some(path_str) = path.to_str() else {
                        return ScanEvent::Error(path, "path is not valid UTF-8".into());
                    };
                    match db::upsert_file(&pool, &meta, path_str).await {
                        Ok(_) => ScanEvent::Processed(path),
                        Err(e) => ScanEvent::Error(path, e.to_string()),
                    }
                }
            })
            .buffer_unordered(10) // Process 10 files in parallel
            .collect()
            .await;

        let mut summary = ScanSummary::default();
        for event in events {
            match event {
                ScanEvent::Processed(_) => summary.processed += 1,
                ScanEvent::Error(path, e) => {
                    tracing::warn!("Failed to catalog {:?}: {}", path, e);
                    summary.errors += 1;
                }
            }
        }

        for path in db::all_paths(&self.pool).await? {
            if !Path::new(&path).exists() && db::delete_track_by_path(&self.pool, &path).await? {
                summary.pruned += 1;
            }
        }

        self.warm_cache().await?;
        tracing::info!(
            processed = summary.processed,
            errors = summary.errors,
            pruned = summary.pruned,
            "Library scan complete"
        );
        Ok(summary)
    }

    async fn lookup_isrc(&self, isrc: &str) -> Result<Option<PathBuf>> {
        let key = isrc.to_uppercase();
        let cached = self.isrc_cache.read().get(&key).cloned();
        if let Some(path) = cached {
            if path.exists() {
                return Ok(Some(path));
            }
            self.isrc_cache.write().remove(&key);
        }

        let Some(entry) = db::find_by_isrc(&self.pool, &key).await? else {
            return Ok(None);
        };
        let path = entry.path_buf();
        if !path.exists() {
            tracing::debug!("Catalogued file {:?} is gone", path);
            return Ok(None);
        }
        self.isrc_cache.write().insert(key, path.clone());
        Ok(Some(path))
    }

    async fn lookup_fuzzy(&self, query: &LibraryQuery) -> Result<Option<PathBuf>> {
        let (Some(artist), Some(title)) = (&query.artist, &query.title) else {
            return Ok(None);
        };

        let target = Track::new(title, artist, query.album.as_deref().unwrap_or(""), "");

        // Raw text first, then the normalized form ("Song (Remix)" -> "song")
        let mut terms = vec![(artist.to_lowercase(), title.to_lowercase())];
        let normalized = (matching::normalize(artist), matching::normalize(title));
        if normalized != terms[0] && !normalized.0.is_empty() && !normalized.1.is_empty() {
            terms.push(normalized);
        }

        let mut best: Option<(f32, PathBuf)> = None;
        for (a, t) in &terms {
            let mut hits = db::search(&self.pool, a, t, query.album.as_deref()).await?;
            if hits.is_empty() && query.album.is_some() {
                hits = db::search(&self.pool, a, t, None).await?;
            }
            for hit in hits {
                let candidate = Candidate {
                    artist: hit.artist_name.clone(),
                    title: hit.title.clone(),
                    album: hit.album_name.clone(),
                    year: 0,
                };
                let confidence = matching::score(&candidate, &target);
                let path = hit.path_buf();
                if confidence >= self.min_fuzzy_confidence
                    && path.exists()
                    && best.as_ref().is_none_or(|(c, _)| confidence > *c)
                {
                    best = Some((confidence, path));
                }
            }
        }

        Ok(best.map(|(_, path)| path))
    }
}

/// Walk `root` and read every audio file's metadata in parallel.
fn read_tree(root: &Path) -> Vec<(PathBuf, TrackMetadata)> {
    let files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && metadata::is_audio_file(e.path()))
        .map(|e| e.into_path())
        .collect();

    files
        .into_par_iter()
        .map(|path| {
            let meta = metadata::read_or_guess(&path);
            (path, meta)
        })
        .collect()
}

struct ImportPlan {
    moved: Vec<(PathBuf, TrackMetadata)>,
    duplicates: usize,
    failures: Vec<String>,
}

/// Move every audio file under `source` into the library layout.
fn place_files(source: &Path, music_dir: &Path, pattern: &str) -> ImportPlan {
    let mut plan = ImportPlan {
        moved: Vec::new(),
        duplicates: 0,
        failures: Vec::new(),
    };

    for (path, meta) in read_tree(source) {
        let dest = organizer::destination_for(&path, &meta, pattern, music_dir);
        if dest.exists() {
            tracing::info!("Skipping duplicate {:?} (already at {:?})", path, dest);
            plan.duplicates += 1;
            continue;
        }
        match organizer::move_path(&path, &dest) {
            Ok(()) => plan.moved.push((dest, meta)),
            Err(e) => plan.failures.push(format!("{}: {e:#}", path.display())),
        }
    }

    if source.is_dir()
        && let Err(e) = organizer::remove_empty_dirs(source, source.parent().unwrap_or(source))
    {
        tracing::warn!("Failed to clean up {:?} after import: {:#}", source, e);
    }
    plan
}

#[async_trait]
impl LibraryIndex for CatalogLibrary {
    async fn exists(&self, query: &LibraryQuery) -> Result<Option<PathBuf>> {
        if let Some(isrc) = &query.isrc
            && let Some(path) = self.lookup_isrc(isrc).await?
        {
            return Ok(Some(path));
        }
        if query.allow_fuzzy {
            return self.lookup_fuzzy(query).await;
        }
        Ok(None)
    }

    async fn add(&self, path: &Path, search_hint: &str) -> Result<AddOutcome> {
        if !path.exists() {
            return Err(Error::not_found(path));
        }
        tracing::debug!(hint = search_hint, "Importing {:?}", path);

        let source = path.to_path_buf();
        let music_dir = self.music_dir.clone();
        let pattern = self.pattern.clone();
        let plan = tokio::task::spawn_blocking(move || place_files(&source, &music_dir, &pattern))
            .await
            .map_err(|e| Error::library(format!("import task failed: {e}")))?;

        for failure in &plan.failures {
            tracing::warn!("Import failed for {}", failure);
        }

        let mut imported = 0usize;
        for (dest, meta) in &plan.moved {
            let dest_str = dest.to_string_lossy();
            db::upsert_file(&self.pool, meta, &dest_str)
                .await
                .with_context(format!("cataloguing {:?}", dest))?;
            if let Some(isrc) = &meta.isrc {
                self.isrc_cache.write().insert(isrc.clone(), dest.clone());
            }
            imported += 1;
        }

        let message = format!(
            "imported {imported} file(s), skipped {} duplicate(s), {} failure(s)",
            plan.duplicates,
            plan.failures.len()
        );
        Ok(AddOutcome {
            imported: imported > 0,
            message,
        })
    }
}

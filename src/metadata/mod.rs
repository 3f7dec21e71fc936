//! Audio file metadata reading.
//!
//! Uses the lofty crate for format-independent metadata access.
//! Supports MP3, FLAC, OGG, M4A, WAV and OPUS files.
//!
//! Downloads often arrive untagged or half-tagged, so [`read_or_guess`]
//! falls back to the `Artist - Title.ext` file naming convention and the
//! parent directory for the album.

use anyhow::{Context, Result};
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::{Accessor, ItemKey};
use std::path::Path;

/// File extensions treated as audio (lower-case).
pub const AUDIO_EXTENSIONS: [&str; 6] = ["mp3", "flac", "ogg", "wav", "m4a", "opus"];

/// Track metadata. Empty strings mean "not tagged".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub year: Option<i32>,
    /// Upper-cased ISRC
    pub isrc: Option<String>,
    pub duration: u64,
    pub track_number: Option<u32>,
}

impl TrackMetadata {
    /// Candidate view for the matcher.
    pub fn to_candidate(&self) -> crate::matching::Candidate {
        crate::matching::Candidate {
            artist: self.artist.clone(),
            title: self.title.clone(),
            album: self.album.clone(),
            year: self.year.unwrap_or(0),
        }
    }
}

/// Whether `path` has an audio file extension (case-insensitive).
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Read embedded tags from an audio file.
pub fn read(path: &Path) -> Result<TrackMetadata> {
    // Probe the file to determine format and read tags
    let tagged_file = Probe::open(path)
        .context("Failed to open file for probing")?
        .read()
        .context("Failed to read file metadata")?;

    // Get the primary tag, or fall back to the first available tag
    let tag = tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag());

    let text = |value: Option<std::borrow::Cow<'_, str>>| {
        value.map(|s| s.trim().to_string()).unwrap_or_default()
    };

    let isrc = tag
        .and_then(|t| t.get_string(&ItemKey::Isrc))
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty());

    Ok(TrackMetadata {
        title: text(tag.and_then(|t| t.title())),
        artist: text(tag.and_then(|t| t.artist())),
        album: text(tag.and_then(|t| t.album())),
        year: tag.and_then(|t| t.year()).map(|y| y as i32),
        isrc,
        duration: tagged_file.properties().duration().as_secs(),
        track_number: tag.and_then(|t| t.track()),
    })
}

/// Read tags, filling gaps from the file and directory names.
///
/// Never fails: an unreadable file yields whatever the path reveals.
pub fn read_or_guess(path: &Path) -> TrackMetadata {
    let mut meta = match read(path) {
        Ok(meta) => meta,
        Err(e) => {
            tracing::debug!("No readable tags in {:?}: {:#}", path, e);
            TrackMetadata::default()
        }
    };

    let guessed = guess_from_path(path);
    if meta.title.is_empty() {
        meta.title = guessed.title;
    }
    if meta.artist.is_empty() {
        meta.artist = guessed.artist;
    }
    if meta.album.is_empty() {
        meta.album = guessed.album;
    }
    if meta.track_number.is_none() {
        meta.track_number = guessed.track_number;
    }
    meta
}

/// Derive metadata from `[NN - ]Artist - Title.ext` and the parent folder.
pub fn guess_from_path(path: &Path) -> TrackMetadata {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .trim();

    let mut parts: Vec<&str> = stem.split(" - ").map(str::trim).collect();

    let mut track_number = None;
    if parts.len() > 1
        && let Ok(n) = parts[0].parse::<u32>()
    {
        track_number = Some(n);
        parts.remove(0);
    }

    let (artist, title) = match parts.as_slice() {
        [] => (String::new(), String::new()),
        [title] => (String::new(), title.to_string()),
        [artist, rest @ ..] => (artist.to_string(), rest.join(" - ")),
    };

    let album = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    TrackMetadata {
        title,
        artist,
        album,
        track_number,
        ..Default::default()
    }
}

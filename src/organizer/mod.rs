//! File organization and movement utilities.
//!
//! Places music files into a structured directory hierarchy based on
//! metadata patterns like `{Artist}/{Album}/{TrackNum} - {Title}.{ext}`,
//! and moves whole directories for the download workspace and quarantine.
//!
//! # Features
//! - Pattern-based destination paths
//! - Filesystem-safe names with a length cap
//! - Rename with copy+delete fallback across devices
//! - Automatic cleanup of empty directories

use crate::metadata::TrackMetadata;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Default library layout.
pub const DEFAULT_PATTERN: &str = "{Artist}/{Album}/{TrackNum} - {Title}.{ext}";

/// Longest single path component we produce, in characters.
pub const MAX_COMPONENT_CHARS: usize = 180;

/// Computes where `source_path` lands inside `destination_root`.
pub fn destination_for(
    source_path: &Path,
    metadata: &TrackMetadata,
    pattern: &str,
    destination_root: &Path,
) -> PathBuf {
    let ext = source_path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_else(|| "mp3".to_string());

    let track_num = metadata
        .track_number
        .map(|n| format!("{:02}", n))
        .unwrap_or_else(|| "00".to_string());

    let field = |value: &str, fallback: &str| {
        let value = if value.trim().is_empty() { fallback } else { value };
        sanitize_component(value, MAX_COMPONENT_CHARS)
    };

    let path_str = pattern
        .replace("{Artist}", &field(&metadata.artist, "Unknown Artist"))
        .replace("{Album}", &field(&metadata.album, "Unknown Album"))
        .replace("{Title}", &field(&metadata.title, "Unknown Title"))
        .replace("{TrackNum}", &track_num)
        .replace("{ext}", &ext);

    destination_root.join(path_str)
}

fn replace_invalid(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect()
}

/// Sanitizes a single path component: invalid characters replaced,
/// whitespace collapsed, leading/trailing dots and spaces trimmed, and
/// capped at `max_chars`. Never returns an empty string or `.`/`..`.
pub fn sanitize_component(name: &str, max_chars: usize) -> String {
    let cleaned = replace_invalid(name);
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let capped: String = collapsed.chars().take(max_chars.max(1)).collect();
    let trimmed = capped.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Moves a file or directory, falling back to copy+delete across devices.
pub fn move_path(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }

    // Rename fails across devices; copy then delete
    if source.is_dir() {
        copy_dir(source, destination)?;
        fs::remove_dir_all(source)
            .with_context(|| format!("Failed to remove source directory: {:?}", source))?;
    } else {
        fs::copy(source, destination)
            .with_context(|| format!("Failed to copy file to: {:?}", destination))?;
        fs::remove_file(source)
            .with_context(|| format!("Failed to remove source file: {:?}", source))?;
    }
    Ok(())
}

fn copy_dir(source: &Path, destination: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", source))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("Unexpected path outside {:?}", source))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {:?}", target))?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy file to: {:?}", target))?;
        }
    }
    Ok(())
}

/// Recursively removes empty directories up the tree, stopping at `stop_at`.
pub fn remove_empty_dirs(path: &Path, stop_at: &Path) -> Result<()> {
    if path == stop_at || !path.starts_with(stop_at) {
        return Ok(());
    }
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        if let Some(parent) = path.parent()
            && let Err(e) = remove_empty_dirs(parent, stop_at)
        {
            tracing::warn!("Failed to remove empty directory {:?}: {:#}", parent, e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta(title: &str, artist: &str, album: &str, track: Option<u32>) -> TrackMetadata {
        TrackMetadata {
            title: title.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
            track_number: track,
            ..Default::default()
        }
    }

    #[test]
    fn test_sanitize_component_caps_and_trims() {
        assert_eq!(sanitize_component("  Hello   World. ", 50), "Hello World");
        assert_eq!(sanitize_component("..", 50), "_");
        assert_eq!(sanitize_component("", 50), "_");
        assert_eq!(sanitize_component("abcdef", 3), "abc");
        assert_eq!(sanitize_component("AC/DC: Live?", 50), "AC_DC_ Live_");
        assert_eq!(sanitize_component("a<b>c|d\tz", 50), "a_b_c_d_z");
    }

    #[test]
    fn test_destination_for_pattern() {
        let path = destination_for(
            Path::new("/tmp/song.MP3"),
            &meta("Song Title", "Test Artist", "Test Album", Some(5)),
            DEFAULT_PATTERN,
            Path::new("/music"),
        );
        assert_eq!(
            path,
            PathBuf::from("/music/Test Artist/Test Album/05 - Song Title.mp3")
        );
    }

    #[test]
    fn test_destination_for_missing_fields() {
        let path = destination_for(
            Path::new("/test.flac"),
            &meta("Song", "", "", None),
            DEFAULT_PATTERN,
            Path::new("/out"),
        );
        assert_eq!(
            path,
            PathBuf::from("/out/Unknown Artist/Unknown Album/00 - Song.flac")
        );
    }

    #[test]
    fn test_destination_for_sanitizes_special_chars() {
        let path = destination_for(
            Path::new("/test.mp3"),
            &meta("What?", "AC/DC", "Back: In Black", Some(1)),
            "{Artist}/{Album}/{Title}.{ext}",
            Path::new("/out"),
        );
        assert_eq!(path, PathBuf::from("/out/AC_DC/Back_ In Black/What_.mp3"));
    }

    #[test]
    fn test_move_path_directory() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("work").join("Artist - Album");
        std::fs::create_dir_all(src.join("CD1")).unwrap();
        std::fs::write(src.join("CD1").join("01.flac"), b"x").unwrap();

        let dest = temp.path().join("failed").join("Artist - Album");
        move_path(&src, &dest).unwrap();

        assert!(!src.exists());
        assert!(dest.join("CD1").join("01.flac").exists());
    }

    #[test]
    fn test_copy_dir_preserves_tree() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("nested").join("a.mp3"), b"a").unwrap();

        let dest = temp.path().join("dest");
        copy_dir(&src, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("nested").join("a.mp3")).unwrap(), b"a");
    }

    #[test]
    fn test_remove_empty_dirs_keeps_occupied_parents() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("downloads");
        let leaf = root.join("Artist - Song").join("Artist - Album [local]");
        std::fs::create_dir_all(&leaf).unwrap();
        std::fs::write(root.join("Artist - Song").join("notes.txt"), b"x").unwrap();

        remove_empty_dirs(&leaf, &root).unwrap();
        assert!(!leaf.exists());
        assert!(root.join("Artist - Song").join("notes.txt").exists());
    }

    #[test]
    fn test_remove_empty_dirs_stops_at_root() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("music");
        let leaf = root.join("Artist").join("Album");
        std::fs::create_dir_all(&leaf).unwrap();

        remove_empty_dirs(&leaf, &root).unwrap();
        assert!(!root.join("Artist").exists());
        assert!(root.exists());
    }
}

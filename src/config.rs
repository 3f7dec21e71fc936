//! Configuration system using TOML files.
//!
//! Config is stored in the OS-standard config directory:
//! - Windows: %APPDATA%\playlist-warden\config.toml
//! - macOS: ~/Library/Application Support/playlist-warden/config.toml
//! - Linux: ~/.config/playlist-warden/config.toml
//!
//! The location can be overridden with `--config` or `PLAYLIST_WARDEN_CONFIG`.
//! Every section has defaults, so a file only needs the parts it changes.
//! The config is loaded once at startup and handed to components by
//! reference; nothing mutates it afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::matching::Thresholds;

/// Destination key used for collection publishing.
pub const COLLECTION_DESTINATION: &str = "collections";

/// Destination key added when `create_m3u` is set on a playlist.
pub const M3U_DESTINATION: &str = "m3u";

/// Longest schedule or stats interval accepted, one year in minutes.
pub const MAX_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Working directories and state locations
    pub paths: PathsConfig,

    /// Local library catalog settings
    pub library: LibraryConfig,

    /// Match confidence thresholds
    pub matching: MatchingConfig,

    /// Download manager behaviour
    pub download: DownloadConfig,

    /// Downloader backends, tried in ascending priority
    pub downloaders: Vec<DownloaderConfig>,

    /// Individually configured playlists, keyed by name
    pub playlists: BTreeMap<String, PlaylistConfig>,

    /// Users whose playlists are mirrored wholesale, keyed by name
    pub users: BTreeMap<String, UserConfig>,
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Per-backend working directories are created here
    pub downloads_dir: PathBuf,

    /// Quarantine area for failed attempts
    pub failed_dir: PathBuf,

    /// Sync state files, one per playlist
    pub state_dir: PathBuf,

    /// Root for published M3U playlists
    pub m3u_dir: PathBuf,

    /// Base directory for playlist manifests and per-user manifest folders
    pub import_dir: PathBuf,

    /// Shared append-only error log
    pub error_log: PathBuf,

    /// Download statistics snapshot
    pub stats_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = data_dir();
        Self {
            downloads_dir: base.join("downloads"),
            failed_dir: base.join("failed"),
            state_dir: base.join("state"),
            m3u_dir: base.join("playlists"),
            import_dir: base.join("import"),
            error_log: base.join("download_errors.log"),
            stats_file: base.join("download_stats.json"),
        }
    }
}

/// Library catalog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// SQLite catalog database
    pub database: PathBuf,

    /// Root of the organized music library
    pub music_dir: PathBuf,

    /// Destination pattern for imported files
    pub path_pattern: String,

    /// Fall back to artist/title queries when the ISRC lookup misses
    pub fuzzy_lookups: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            database: data_dir().join("library.db"),
            music_dir: dirs::audio_dir().unwrap_or_else(|| data_dir().join("music")),
            path_pattern: crate::organizer::DEFAULT_PATTERN.to_string(),
            fuzzy_lookups: true,
        }
    }
}

/// Match thresholds. Empirically chosen, so they are tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum confidence before a backend download is attempted
    pub min_download_confidence: f32,
    pub exact: f32,
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        let t = Thresholds::default();
        Self {
            min_download_confidence: 0.6,
            exact: t.exact,
            high: t.high,
            medium: t.medium,
            low: t.low,
        }
    }
}

impl MatchingConfig {
    /// Tier breakpoints as used by the matcher.
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            exact: self.exact,
            high: self.high,
            medium: self.medium,
            low: self.low,
        }
    }
}

/// Download manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Re-run the chain when every backend failed
    pub retry_enabled: bool,

    /// Total passes over the chain per track and run
    pub max_attempts: u32,

    /// First backoff delay between passes, doubled each time
    pub backoff_base_ms: u64,

    /// Upper bound for a single backoff delay
    pub backoff_max_ms: u64,

    /// Tracks of one playlist resolved concurrently
    pub max_concurrent_tracks: usize,

    /// How often `run` persists statistics
    pub stats_interval_minutes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            retry_enabled: true,
            max_attempts: 2,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_concurrent_tracks: 4,
            stats_interval_minutes: 10,
        }
    }
}

/// One downloader backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Unique name, used for working directories and statistics
    pub name: String,

    /// Registry key: "local" or "command"
    pub kind: String,

    /// Lower is tried first
    pub priority: i32,

    pub enabled: bool,

    /// Concurrency ceiling for this backend
    pub max_concurrent: usize,

    /// Per-operation timeout
    pub timeout_secs: u64,

    /// `local`: directory of loose audio files to pick from
    pub staging_dir: Option<PathBuf>,

    /// `command`: program to execute
    pub program: Option<String>,

    /// `command`: argument templates
    pub args: Vec<String>,

    /// `command`: optional search invocation printing
    /// `artist<TAB>title<TAB>album<TAB>year<TAB>locator` lines
    pub match_args: Vec<String>,

    /// `command`: exit code that signals rate limiting
    pub rate_limit_exit_code: Option<i32>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            priority: 100,
            enabled: true,
            max_concurrent: 1,
            timeout_secs: 600,
            staging_dir: None,
            program: None,
            args: Vec::new(),
            match_args: Vec::new(),
            rate_limit_exit_code: None,
        }
    }
}

/// How a playlist is published
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Playlist,
    Collection,
    Both,
}

/// One individually configured playlist
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistConfig {
    /// Importer locator (manifest path for the file importer)
    pub url: String,

    /// Display title override
    pub title: Option<String>,

    pub sync_mode: SyncMode,

    /// Publish destinations (e.g. one per user)
    pub destinations: Vec<String>,

    pub download_missing: bool,

    /// Also publish to the plain `m3u` destination
    pub create_m3u: bool,

    pub schedule_minutes: u64,

    pub enabled: bool,

    /// Always re-resolve, even when the snapshot id is unchanged
    pub force_update: bool,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            title: None,
            sync_mode: SyncMode::Playlist,
            destinations: Vec::new(),
            download_missing: true,
            create_m3u: false,
            schedule_minutes: 60,
            enabled: true,
            force_update: false,
        }
    }
}

impl PlaylistConfig {
    /// Destinations this playlist publishes to, given its sync mode.
    pub fn publish_targets(&self) -> Vec<String> {
        publish_targets(self.sync_mode, &self.destinations, self.create_m3u)
    }
}

/// A user whose playlists are all mirrored
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Identifier on the remote service
    pub user_id: String,

    pub include_collaborative: bool,

    pub include_followed: bool,

    pub sync_mode: SyncMode,

    pub destinations: Vec<String>,

    pub download_missing: bool,

    pub schedule_minutes: u64,

    pub enabled: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            include_collaborative: true,
            include_followed: false,
            sync_mode: SyncMode::Playlist,
            destinations: Vec::new(),
            download_missing: true,
            schedule_minutes: 720,
            enabled: true,
        }
    }
}

impl UserConfig {
    /// Playlist-level settings shared by every playlist of this user.
    pub fn playlist_config(&self, url: impl Into<String>) -> PlaylistConfig {
        PlaylistConfig {
            url: url.into(),
            title: None,
            sync_mode: self.sync_mode,
            destinations: self.destinations.clone(),
            download_missing: self.download_missing,
            create_m3u: false,
            schedule_minutes: self.schedule_minutes,
            enabled: self.enabled,
            force_update: false,
        }
    }
}

fn publish_targets(mode: SyncMode, destinations: &[String], create_m3u: bool) -> Vec<String> {
    let mut targets: Vec<String> = match mode {
        SyncMode::Playlist | SyncMode::Both => destinations.to_vec(),
        SyncMode::Collection => Vec::new(),
    };
    if matches!(mode, SyncMode::Collection | SyncMode::Both) {
        targets.push(COLLECTION_DESTINATION.to_string());
    }
    if create_m3u {
        targets.push(M3U_DESTINATION.to_string());
    }
    targets.sort();
    targets.dedup();
    targets
}

impl Config {
    /// Check the configuration for problems. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        let m = &self.matching;
        for (name, value) in [
            ("min_download_confidence", m.min_download_confidence),
            ("exact", m.exact),
            ("high", m.high),
            ("medium", m.medium),
            ("low", m.low),
        ] {
            if !(0.0..=1.0).contains(&value) {
                issues.push(format!("matching.{name} must be within 0.0..=1.0, got {value}"));
            }
        }
        if !(m.exact >= m.high && m.high >= m.medium && m.medium >= m.low) {
            issues.push("matching thresholds must satisfy exact >= high >= medium >= low".into());
        }

        if self.download.max_concurrent_tracks == 0 {
            issues.push("download.max_concurrent_tracks must be at least 1".into());
        }
        if self.download.max_attempts == 0 {
            issues.push("download.max_attempts must be at least 1".into());
        }
        if self.download.backoff_base_ms > self.download.backoff_max_ms {
            issues.push("download.backoff_base_ms exceeds download.backoff_max_ms".into());
        }
        if self.download.stats_interval_minutes > MAX_INTERVAL_MINUTES {
            issues.push(format!(
                "download.stats_interval_minutes must be at most {MAX_INTERVAL_MINUTES}"
            ));
        }

        let mut names = HashSet::new();
        for d in &self.downloaders {
            let label = if d.name.is_empty() { "<unnamed>" } else { d.name.as_str() };
            if d.name.is_empty() {
                issues.push("a downloader has no name".into());
            } else if !names.insert(d.name.as_str()) {
                issues.push(format!("duplicate downloader name '{}'", d.name));
            }
            if !crate::downloader::registry::is_known_kind(&d.kind) {
                issues.push(format!(
                    "downloader '{label}' has unknown kind '{}' (known: {})",
                    d.kind,
                    crate::downloader::registry::known_kinds().join(", ")
                ));
            }
            if d.max_concurrent == 0 {
                issues.push(format!("downloader '{label}' max_concurrent must be at least 1"));
            }
            match d.kind.as_str() {
                "local" if d.staging_dir.is_none() => {
                    issues.push(format!("downloader '{label}' (local) needs staging_dir"))
                }
                "command" if d.program.as_deref().is_none_or(str::is_empty) => {
                    issues.push(format!("downloader '{label}' (command) needs program"))
                }
                _ => {}
            }
        }

        for (name, p) in &self.playlists {
            if p.url.trim().is_empty() {
                issues.push(format!("playlist '{name}' has no url"));
            }
            if p.schedule_minutes == 0 {
                issues.push(format!("playlist '{name}' schedule_minutes must be at least 1"));
            } else if p.schedule_minutes > MAX_INTERVAL_MINUTES {
                issues.push(format!(
                    "playlist '{name}' schedule_minutes must be at most {MAX_INTERVAL_MINUTES}"
                ));
            }
            if p.publish_targets().is_empty() {
                issues.push(format!("playlist '{name}' has no publish destinations"));
            }
        }

        for (name, u) in &self.users {
            if u.user_id.trim().is_empty() {
                issues.push(format!("user '{name}' has no user_id"));
            }
            if u.schedule_minutes == 0 {
                issues.push(format!("user '{name}' schedule_minutes must be at least 1"));
            } else if u.schedule_minutes > MAX_INTERVAL_MINUTES {
                issues.push(format!(
                    "user '{name}' schedule_minutes must be at most {MAX_INTERVAL_MINUTES}"
                ));
            }
        }

        issues
    }

    /// Downloaders that are enabled, in configuration order.
    pub fn enabled_downloaders(&self) -> impl Iterator<Item = &DownloaderConfig> {
        self.downloaders.iter().filter(|d| d.enabled)
    }
}

/// Commented example configuration printed by `config-example`.
pub const EXAMPLE: &str = r#"# playlist-warden configuration

[paths]
downloads_dir = "/var/lib/playlist-warden/downloads"
failed_dir = "/var/lib/playlist-warden/failed"
state_dir = "/var/lib/playlist-warden/state"
m3u_dir = "/srv/music/playlists"
import_dir = "/var/lib/playlist-warden/import"
error_log = "/var/lib/playlist-warden/download_errors.log"
stats_file = "/var/lib/playlist-warden/download_stats.json"

[library]
database = "/var/lib/playlist-warden/library.db"
music_dir = "/srv/music/library"
path_pattern = "{Artist}/{Album}/{TrackNum} - {Title}.{ext}"
fuzzy_lookups = true

[matching]
min_download_confidence = 0.6
exact = 0.95
high = 0.85
medium = 0.7
low = 0.5

[download]
retry_enabled = true
max_attempts = 2
backoff_base_ms = 1000
backoff_max_ms = 30000
max_concurrent_tracks = 4
stats_interval_minutes = 10

# Lower priority is tried first.
[[downloaders]]
name = "staging"
kind = "local"
priority = 10
max_concurrent = 4
staging_dir = "/srv/music/incoming"

[[downloaders]]
name = "fetcher"
kind = "command"
priority = 20
max_concurrent = 1
timeout_secs = 900
program = "fetch-track"
args = ["--out", "{dest}", "--isrc", "{isrc}", "--query", "{query}"]
rate_limit_exit_code = 75

[playlists.discover_weekly]
url = "discover_weekly.json"
sync_mode = "both"
destinations = ["alice"]
download_missing = true
create_m3u = true
schedule_minutes = 360

[users.bob]
user_id = "bob"
include_collaborative = true
include_followed = false
destinations = ["bob"]
schedule_minutes = 720
"#;

// ============================================================================
// Config File Operations
// ============================================================================

/// Base directory for runtime data when no explicit path is configured.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("playlist-warden"))
        .unwrap_or_else(|| PathBuf::from(".playlist-warden"))
}

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("playlist-warden"))
}

/// Get the full path to the default config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Load configuration from disk.
///
/// An explicit path must exist. Without one, the default location is used
/// and a missing file yields the default configuration. Unreadable or
/// unparsable files are errors: a broken config is fatal for the process.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            path.to_path_buf()
        }
        None => {
            let Some(path) = config_path() else {
                tracing::warn!("Could not determine config directory, using defaults");
                return Ok(Config::default());
            };
            if !path.exists() {
                tracing::info!("No config file found at {:?}, using defaults", path);
                return Ok(Config::default());
            }
            path
        }
    };

    let contents =
        std::fs::read_to_string(&path).map_err(|e| ConfigError::Read(path.clone(), e))?;
    let config: Config =
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.clone(), e))?;
    tracing::info!("Loaded config from {:?}", path);
    Ok(config)
}

/// Save configuration to `path`, creating parent directories.
pub fn save(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::CreateDir(dir.to_path_buf(), e))?;
    }

    let contents = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;

    // Write atomically (write to temp, then rename)
    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents).map_err(|e| ConfigError::Write(temp_path.clone(), e))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| ConfigError::Rename(temp_path, path.to_path_buf(), e))?;

    tracing::info!("Saved config to {:?}", path);
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file {0} does not exist")]
    Missing(PathBuf),

    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("Failed to create config directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("Failed to write config to {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("Failed to rename temp file {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, std::io::Error),
}

// ============================================================================
// Tests
// ============================================================================

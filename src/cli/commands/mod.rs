//! CLI command definitions and dispatch.
//!
//! Each subcommand lives in its own submodule:
//! - `sync`: one-shot and scheduled reconciliation
//! - `status`: stored sync state and download statistics
//! - `setup`: configuration checks and the example file
//! - `library`: catalog maintenance

mod library;
mod setup;
mod status;
mod sync;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;

use crate::config::{self, Config, ConfigError};
use crate::download_manager::DownloadManager;
use crate::downloader::{DownloaderChain, registry};
use crate::importer::FileImporter;
use crate::library::CatalogLibrary;
use crate::publisher::M3uPublisher;
use crate::reconciler::Reconciler;
use crate::sync_state::SyncStateStore;

pub use library::cmd_scan_library;
pub use setup::{cmd_config_example, cmd_validate_config};
pub use status::cmd_status;
pub use sync::{cmd_run, cmd_sync};

/// Playlist Warden CLI
#[derive(Parser)]
#[command(author, version, about = "Mirror remote playlists into a local music library", long_about = None)]
pub struct Cli {
    /// Config file (default: <config dir>/playlist-warden/config.toml)
    #[arg(short, long, global = true, env = "PLAYLIST_WARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level for this crate (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Reconcile every enabled playlist and user once
    Sync {
        /// Only this playlist or user
        #[arg(short, long)]
        playlist: Option<String>,
        /// Re-resolve tracks even when the playlist is unchanged
        #[arg(long)]
        force: bool,
    },
    /// Reconcile on each playlist's schedule until interrupted
    Run,
    /// Show stored sync state and download statistics
    Status,
    /// Check the configuration and list problems
    ValidateConfig,
    /// Print a commented example configuration
    ConfigExample,
    /// Rebuild the library catalog from the music directory
    ScanLibrary {
        /// Directory to scan (default: library.music_dir)
        path: Option<PathBuf>,
    },
}

/// Run the parsed command.
pub fn run_command(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.config.as_deref();
    match &cli.command {
        Commands::Sync { playlist, force } => {
            cmd_sync(&Runtime::new()?, config, playlist.as_deref(), *force)
        }
        Commands::Run => cmd_run(&Runtime::new()?, config),
        Commands::Status => cmd_status(&Runtime::new()?, config),
        Commands::ValidateConfig => cmd_validate_config(config),
        Commands::ConfigExample => cmd_config_example(),
        Commands::ScanLibrary { path } => cmd_scan_library(&Runtime::new()?, config, path.as_deref()),
    }
}

// ============================================================================
// Shared helper functions
// ============================================================================

/// Load the configuration and refuse to continue if it has problems.
pub(crate) fn load_valid_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let config = config::load(path)?;
    let issues = config.validate();
    if !issues.is_empty() {
        for issue in &issues {
            tracing::error!("{}", issue);
        }
        return Err(ConfigError::Invalid(issues).into());
    }
    Ok(config)
}

/// Wire the concrete components described by `config`.
pub(crate) async fn build_reconciler(config: &Config) -> anyhow::Result<Reconciler> {
    let chain = DownloaderChain::validated(registry::build_all(config)).await;
    if chain.is_empty() {
        tracing::warn!("No usable downloaders; missing tracks will stay unresolved");
    } else {
        tracing::info!(backends = ?chain.names(), "Downloader chain ready");
    }
    let downloads = DownloadManager::new(chain, config);

    let library = CatalogLibrary::open(&config.library, config.matching.medium)
        .await
        .with_context(|| format!("opening catalog {:?}", config.library.database))?;

    Ok(Reconciler::new(
        Arc::new(FileImporter::new(&config.paths.import_dir)),
        Arc::new(library),
        Arc::new(downloads),
        Arc::new(M3uPublisher::new(&config.paths.m3u_dir)),
        SyncStateStore::new(&config.paths.state_dir),
    )
    .configured(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync_with_global_flags() {
        let cli = Cli::try_parse_from([
            "playlist-warden",
            "sync",
            "--playlist",
            "hits",
            "--force",
            "--config",
            "/etc/pw.toml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Commands::Sync {
                playlist: Some("hits".into()),
                force: true
            }
        );
        assert_eq!(cli.config, Some(PathBuf::from("/etc/pw.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_parse_scan_library_default_path() {
        let cli = Cli::try_parse_from(["playlist-warden", "scan-library"]).unwrap();
        assert_eq!(cli.command, Commands::ScanLibrary { path: None });
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["playlist-warden"]).is_err());
    }

    #[test]
    fn test_load_valid_config_rejects_problems() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[playlists.hits]\nurl = \"\"\n").unwrap();

        let err = load_valid_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("playlist 'hits' has no url"));
    }

    #[tokio::test]
    async fn test_build_reconciler_with_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.library.database = dir.path().join("db").join("library.db");
        config.paths.state_dir = dir.path().join("state");

        let reconciler = build_reconciler(&config).await.unwrap();
        assert!(!reconciler.downloads().has_backends());
        assert_eq!(reconciler.store().dir(), dir.path().join("state"));
    }
}

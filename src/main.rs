//! Playlist Warden - mirrors remote playlists into a local music library.
//!
//! Each configured playlist is fetched, diffed against its stored state,
//! resolved track by track against the library catalog, filled in through a
//! priority-ordered chain of downloaders and finally published to its
//! destinations.

pub mod cli;
pub mod config;
pub mod db;
pub mod download_manager;
pub mod downloader;
pub mod error;
pub mod importer;
pub mod library;
pub mod matching;
pub mod metadata;
pub mod model;
pub mod organizer;
pub mod publisher;
pub mod reconciler;
pub mod scheduler;
pub mod sync_state;
#[cfg(test)]
pub mod test_utils;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    // --log-level wins over RUST_LOG for this crate
    let directive = format!(
        "playlist_warden={}",
        args.log_level.as_deref().unwrap_or("info")
    );
    let filter = match (&args.log_level, std::env::var("RUST_LOG")) {
        (None, Ok(_)) => EnvFilter::from_default_env(),
        _ => EnvFilter::from_default_env().add_directive(directive.parse()?),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    cli::run_command(&args)
}

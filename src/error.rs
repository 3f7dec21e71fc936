//! Application-wide error types.
//!
//! Library modules use specific error types via `thiserror`, while
//! CLI/main uses `anyhow` for convenient error propagation.
//!
//! # Design
//!
//! - [`Error`]: Top-level application error enum
//! - Module-specific errors (e.g., [`ImportError`], [`StateError`]) for detailed handling
//! - Expected outcomes such as "not found" or "rate limited" are modelled as
//!   status values ([`crate::downloader::DownloadStatus`]), not errors
//!
//! # Example
//!
//! ```ignore
//! use playlist_warden::error::{Error, Result, ResultExt};
//!
//! fn load(path: &Path) -> Result<SyncState> {
//!     let text = std::fs::read_to_string(path).with_context("reading sync state")?;
//!     Ok(serde_json::from_str(&text)?)
//! }
//! ```

use std::path::PathBuf;

use crate::config::ConfigError;
use crate::importer::ImportError;
use crate::sync_state::StateError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level application error.
///
/// Aggregates errors from all subsystems for unified handling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catalog database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Sync state persistence error
    #[error("Sync state error: {0}")]
    StateStore(#[from] StateError),

    /// Remote playlist import error
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    /// Library index error
    #[error("Library error: {0}")]
    Library(String),

    /// Playlist publishing error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Download bookkeeping error (workspace, quarantine, logs)
    #[error("Download error: {0}")]
    Download(String),

    /// File not found
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a library error.
    pub fn library(message: impl Into<String>) -> Self {
        Self::Library(message.into())
    }

    /// Create a publish error.
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish(message.into())
    }

    /// Create a download error.
    pub fn download(message: impl Into<String>) -> Self {
        Self::Download(message.into())
    }

    /// Create a not found error.
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound(path.into())
    }

    /// Add context to an error.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn with_context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Io(e).context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Database(e).context(ctx))
    }
}

//! Command-line interface for playlist-warden.
//!
//! Provides one-shot and scheduled syncing plus configuration, status and
//! catalog maintenance commands.

mod commands;

pub use commands::{Cli, Commands, run_command};

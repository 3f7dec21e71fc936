//! Configuration commands.

use std::path::Path;

use crate::config::{self, ConfigError};

/// Load the configuration and report every problem found.
pub fn cmd_validate_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = config::load(config_path)?;
    let issues = config.validate();
    if issues.is_empty() {
        println!(
            "Configuration OK: {} playlist(s), {} user(s), {} downloader(s) enabled",
            config.playlists.values().filter(|p| p.enabled).count(),
            config.users.values().filter(|u| u.enabled).count(),
            config.enabled_downloaders().count()
        );
        return Ok(());
    }

    eprintln!("Found {} problem(s):", issues.len());
    for issue in &issues {
        eprintln!("  - {}", issue);
    }
    Err(ConfigError::Invalid(issues).into())
}

pub fn cmd_config_example() -> anyhow::Result<()> {
    print!("{}", config::EXAMPLE);
    Ok(())
}

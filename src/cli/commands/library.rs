//! Library catalog maintenance.

use std::path::Path;
use tokio::runtime::Runtime;

use crate::library::CatalogLibrary;

/// Rebuild the catalog from `path`, or from the configured music directory.
pub fn cmd_scan_library(
    rt: &Runtime,
    config_path: Option<&Path>,
    path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = crate::config::load(config_path)?;
    rt.block_on(async {
        let library = CatalogLibrary::open(&config.library, config.matching.medium).await?;
        let root = path.unwrap_or(library.music_dir()).to_path_buf();
        if !root.is_dir() {
            anyhow::bail!("{:?} is not a directory", root);
        }

        println!("Scanning {:?}...", root);
        let summary = library.scan(&root).await?;
        println!(
            "Scan complete: {} tracks catalogued, {} unreadable, {} removed",
            summary.processed, summary.errors, summary.pruned
        );
        anyhow::Ok(())
    })
}

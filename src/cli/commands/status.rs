//! Sync state and statistics report.

use std::path::Path;
use tokio::runtime::Runtime;

use crate::download_manager::{StatsSnapshot, stats};
use crate::model::PlaylistSnapshot;
use crate::sync_state::SyncStateStore;

/// Print every stored playlist and the persisted download statistics.
pub fn cmd_status(rt: &Runtime, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = crate::config::load(config_path)?;
    rt.block_on(async {
        let store = SyncStateStore::new(&config.paths.state_dir);
        let snapshots = store.list().await?;

        if snapshots.is_empty() {
            println!("No playlists synced yet ({:?})", store.dir());
        } else {
            println!("Playlists ({}):", snapshots.len());
            for snapshot in &snapshots {
                print_snapshot(snapshot);
            }
        }
        anyhow::Ok(())
    })?;

    println!();
    if config.paths.stats_file.exists() {
        print_stats(&stats::load(&config.paths.stats_file)?);
    } else {
        println!("No download statistics yet.");
    }
    Ok(())
}

fn print_snapshot(snapshot: &PlaylistSnapshot) {
    let resolved = snapshot.resolved_tracks().count();
    println!(
        "  {} [{}]: {}/{} tracks resolved",
        snapshot.title,
        if snapshot.snapshot_id.is_empty() {
            "-"
        } else {
            snapshot.snapshot_id.as_str()
        },
        resolved,
        snapshot.tracks.len()
    );
    for target in &snapshot.publish_targets {
        let state = if snapshot.is_up_to_date_for(target) {
            "up to date"
        } else {
            "pending"
        };
        println!("    {}: {}", target, state);
    }
}

fn print_stats(stats: &StatsSnapshot) {
    println!(
        "Downloads: {} attempts, {} succeeded, {} failed ({:.0}% success)",
        stats.attempts,
        stats.successes,
        stats.failures,
        stats.success_rate() * 100.0
    );
    if let Some(since) = stats.started_at {
        println!("  Since: {}", since.to_rfc3339());
    }
    for (name, b) in &stats.backends {
        println!(
            "  {}: {} attempts, {} ok, {} failed, {} rate limited, {} timed out",
            name, b.attempts, b.successes, b.failures, b.rate_limited, b.timeouts
        );
    }
    if !stats.quality_tiers.is_empty() {
        let tiers: Vec<String> = stats
            .quality_tiers
            .iter()
            .map(|(tier, n)| format!("{}={}", tier, n))
            .collect();
        println!("  Match quality: {}", tiers.join(", "));
    }
}

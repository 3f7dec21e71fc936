//! Reconciliation commands.

use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use super::{build_reconciler, load_valid_config};
use crate::reconciler::ReconcileReport;
use crate::scheduler::{self, Scheduler};

/// Reconcile every enabled playlist and user once, then print a summary.
pub fn cmd_sync(
    rt: &Runtime,
    config_path: Option<&Path>,
    only: Option<&str>,
    force: bool,
) -> anyhow::Result<()> {
    let config = Arc::new(load_valid_config(config_path)?);
    rt.block_on(async {
        let reconciler = Arc::new(build_reconciler(&config).await?);
        let scheduler = Scheduler::new(config.clone(), reconciler);

        let cancel = CancellationToken::new();
        scheduler::cancel_on_ctrl_c(cancel.clone());

        let reports = scheduler.sync_once(only, force, &cancel).await?;
        print_summary(&reports);
        anyhow::Ok(())
    })
}

/// Reconcile on schedule until Ctrl-C.
pub fn cmd_run(rt: &Runtime, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Arc::new(load_valid_config(config_path)?);
    rt.block_on(async {
        let reconciler = Arc::new(build_reconciler(&config).await?);
        let scheduler = Arc::new(Scheduler::new(config.clone(), reconciler));

        let cancel = CancellationToken::new();
        scheduler::cancel_on_ctrl_c(cancel.clone());
        println!("Running {} job(s), press Ctrl-C to stop", scheduler.jobs().len());

        scheduler.run(cancel).await?;
        anyhow::Ok(())
    })
}

fn print_summary(reports: &[ReconcileReport]) {
    if reports.is_empty() {
        println!("Nothing to sync.");
        return;
    }
    for report in reports {
        println!("{}", report);
    }

    let total: usize = reports.iter().map(|r| r.total).sum();
    let resolved: usize = reports.iter().map(|r| r.resolved).sum();
    let downloaded: usize = reports.iter().map(|r| r.downloaded).sum();
    let failed: usize = reports.iter().map(|r| r.failed).sum();
    println!();
    println!(
        "{} playlist(s): {}/{} tracks resolved, {} downloaded, {} failed",
        reports.len(),
        resolved,
        total,
        downloaded,
        failed
    );
}

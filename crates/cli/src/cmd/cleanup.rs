//! Orphan cleanup: reconcile state with what actually exists

use crate::ctx::Ctx;
use crate::orphan;
use crate::util;
use anyhow::Result;
use owo_colors::OwoColorize;

pub async fn run(ctx: &Ctx, dry_run: bool, force: bool) -> Result<()> {
    let state = match ctx.store.load()? {
        Some(state) => state,
        None => {
            println!("Nothing to clean up - state is uninitialized.");
            return Ok(());
        }
    };

    let report = orphan::detect(ctx, &state).await?;
    if report.is_clean() {
        println!("{} No orphaned resources found", "✓".green());
        return Ok(());
    }

    println!(
        "Found {} orphaned resource(s) ({} wasted):",
        report.total_orphans().to_string().yellow(),
        util::format_size(report.total_wasted_bytes)
    );
    for container in &report.containers {
        println!("  container {}", container.name);
    }
    for dataset in &report.datasets {
        println!(
            "  dataset   {} ({})",
            dataset.name,
            util::format_size(dataset.used_bytes)
        );
    }

    if dry_run {
        println!();
        println!("Dry run - nothing removed.");
        return Ok(());
    }

    if !force && !util::confirm("Remove these orphans?")? {
        println!("Aborted.");
        return Ok(());
    }

    let mut failures = Vec::new();
    let mut reclaimed = 0u64;

    // Containers first; they may hold dataset mounts busy.
    for container in &report.containers {
        let removal = async {
            if container.status.is_running() {
                let _ = ctx
                    .docker
                    .stop_container(&container.id, ctx.stop_timeout())
                    .await;
            }
            ctx.docker.remove_container(&container.id, true).await
        };
        match removal.await {
            Ok(()) => println!("  {} removed container {}", "✓".green(), container.name),
            Err(e) => failures.push(format!("container {}: {:#}", container.name, e)),
        }
    }

    for dataset in &report.datasets {
        match ctx.zfs.destroy_dataset(&dataset.name, true).await {
            Ok(()) => {
                reclaimed += dataset.used_bytes;
                println!("  {} destroyed dataset {}", "✓".green(), dataset.name);
            }
            Err(e) => failures.push(format!("dataset {}: {:#}", dataset.name, e)),
        }
    }

    println!();
    println!(
        "{} Cleanup finished - {} reclaimed",
        "✓".green(),
        util::format_size(reclaimed)
    );
    if !failures.is_empty() {
        println!("{} resource(s) could not be removed:", failures.len().to_string().red());
        for failure in &failures {
            println!("  {} {}", "✗".red(), failure);
        }
    }
    Ok(())
}

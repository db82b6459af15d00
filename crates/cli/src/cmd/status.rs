//! Overall system status

use crate::ctx::Ctx;
use crate::util;
use anyhow::Result;
use owo_colors::OwoColorize;
use pgbranch_state::BranchStatus;

pub async fn run(ctx: &Ctx) -> Result<()> {
    let state = match ctx.store.load()? {
        Some(state) => state,
        None => {
            println!("Not initialized. Create a project with 'pgbranch project create <name>'.");
            return Ok(());
        }
    };

    let pool = ctx.zfs.pool_status(&state.zfs_pool).await?;
    let health = if pool.health == "ONLINE" {
        pool.health.green().to_string()
    } else {
        pool.health.red().to_string()
    };
    println!("{}", "Pool".bold());
    println!(
        "  {} ({}) - {} used of {}, {} free",
        state.zfs_pool,
        health,
        util::format_size(pool.allocated_bytes),
        util::format_size(pool.size_bytes),
        util::format_size(pool.free_bytes)
    );
    println!();

    let total_branches = state.all_branches().count();
    let running = state
        .all_branches()
        .filter(|b| b.status == BranchStatus::Running)
        .count();
    println!("{}", "Inventory".bold());
    println!(
        "  {} project(s), {} branch(es) ({} running), {} snapshot(s)",
        state.projects.len(),
        total_branches,
        running,
        state.snapshots.len()
    );
    println!();

    for project in &state.projects {
        println!("{}", project.name.cyan().bold());
        for branch in &project.branches {
            let status = match branch.status {
                BranchStatus::Running => "running".green().to_string(),
                BranchStatus::Stopped => "stopped".red().to_string(),
            };
            println!(
                "  {:<26} {:<18} port {:<6} {}",
                branch.name,
                status,
                branch.port,
                util::format_size(branch.size_bytes)
            );
        }
    }
    Ok(())
}

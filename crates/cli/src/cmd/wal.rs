//! WAL archive inspection and cleanup

use crate::ctx::Ctx;
use crate::util;
use anyhow::Result;
use chrono::{Duration, Utc};
use owo_colors::OwoColorize;
use pgbranch_state::{user_error_with_hint, Branch};

/// Default retention window for `wal cleanup` in days.
const DEFAULT_CLEANUP_DAYS: i64 = 7;

pub async fn info(ctx: &Ctx, branch: Option<String>) -> Result<()> {
    let state = match ctx.store.load()? {
        Some(state) => state,
        None => {
            println!("No WAL archives.");
            return Ok(());
        }
    };

    let branches: Vec<&Branch> = match &branch {
        Some(name) => vec![state.branch(name).ok_or_else(|| {
            user_error_with_hint(
                format!("branch '{}' not found", name),
                "run 'pgbranch branch list'",
            )
        })?],
        None => state.all_branches().collect(),
    };

    for branch in branches {
        let info = ctx.wal.archive_info(&branch.zfs_dataset)?;
        println!("{}", branch.name.cyan().bold());
        println!("  Path:  {}", ctx.wal.archive_path(&branch.zfs_dataset).display());
        println!("  Files: {}", info.file_count);
        println!("  Size:  {}", util::format_size(info.total_bytes));
        if let (Some(oldest), Some(newest)) = (&info.oldest_name, &info.newest_name) {
            println!("  Range: {} .. {}", oldest, newest);
        }
        if let Some(mtime) = info.newest_mtime {
            println!("  Last archived: {}", util::format_relative_time(mtime));
        }

        let gaps = ctx.wal.verify_integrity(&branch.zfs_dataset)?;
        if gaps.is_empty() {
            println!("  Integrity: {}", "no gaps".green());
        } else {
            println!("  Integrity: {} missing segment(s)", gaps.len().to_string().red());
            for gap in gaps {
                println!("    missing {}", gap);
            }
        }
        println!();
    }
    Ok(())
}

pub async fn cleanup(ctx: &Ctx, name: &str, days: Option<i64>, dry_run: bool) -> Result<()> {
    let state = ctx.store.load_required()?;
    let branch = state.branch(name).ok_or_else(|| {
        user_error_with_hint(
            format!("branch '{}' not found", name),
            "run 'pgbranch branch list'",
        )
    })?;

    let days = days.unwrap_or(DEFAULT_CLEANUP_DAYS);
    let cutoff = Utc::now() - Duration::days(days);

    if dry_run {
        let names = ctx.wal.files_before(&branch.zfs_dataset, cutoff)?;
        if names.is_empty() {
            println!("No WAL segments older than {} days.", days);
        } else {
            println!("Would delete {} segment(s):", names.len());
            for name in names {
                println!("  {}", name);
            }
        }
        return Ok(());
    }

    let deleted = ctx.wal.cleanup_before(&branch.zfs_dataset, cutoff)?;
    println!(
        "{} Deleted {} WAL segment(s) older than {} days from '{}'",
        "✓".green(),
        deleted,
        days,
        branch.name.cyan()
    );
    Ok(())
}

//! Snapshot operations: create, list, delete, cleanup

use crate::ctx::Ctx;
use crate::util;
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use owo_colors::OwoColorize;
use pgbranch_state::{user_error_with_hint, validate_name, BranchRef, Snapshot};
use pgbranch_wal::create_consistent_snapshot;
use uuid::Uuid;

/// Default retention window for `snapshot cleanup` in days.
const DEFAULT_CLEANUP_DAYS: i64 = 30;

pub async fn create(ctx: &Ctx, name: &str, label: Option<String>) -> Result<()> {
    let branch_ref = BranchRef::parse(name)?;
    if let Some(label) = &label {
        validate_name(label)?;
    }

    let state = ctx.store.load_required()?;
    let branch = state
        .branch(&branch_ref.namespaced())
        .cloned()
        .ok_or_else(|| {
            user_error_with_hint(
                format!("branch '{}' not found", name),
                "run 'pgbranch branch list'",
            )
        })?;
    let project = state
        .project(&branch.project_name)
        .context("project missing for branch")?;

    let dataset_path = ctx.dataset_path(&state, &branch.zfs_dataset);
    let outcome = create_consistent_snapshot(
        ctx.docker.as_ref(),
        ctx.zfs.as_ref(),
        &dataset_path,
        branch.status,
        &branch_ref.container_name(),
        &project.credentials.username,
        &project.credentials.database,
        label.as_deref(),
    )
    .await?;

    let size_bytes = ctx.zfs.snapshot_size(&outcome.full_snapshot_name).await?;
    let record = Snapshot {
        id: Uuid::new_v4(),
        branch_id: branch.id,
        branch_name: branch.name.clone(),
        project_name: branch.project_name.clone(),
        zfs_snapshot: outcome.full_snapshot_name.clone(),
        created_at: Utc::now(),
        label,
        size_bytes,
    };
    let record_id = record.id;

    ctx.store.update(|s| {
        s.as_mut()
            .context("state file disappeared")?
            .add_snapshot(record.clone());
        Ok(())
    })?;

    println!(
        "{} Snapshot {} of '{}'",
        "✓".green(),
        outcome.full_snapshot_name.dimmed(),
        branch.name.cyan()
    );
    println!("  Id: {}", record_id);
    Ok(())
}

pub async fn list(ctx: &Ctx, branch: Option<String>) -> Result<()> {
    let state = match ctx.store.load()? {
        Some(state) => state,
        None => {
            println!("No snapshots.");
            return Ok(());
        }
    };

    let snapshots: Vec<&Snapshot> = state
        .snapshots
        .iter()
        .filter(|s| branch.as_deref().map_or(true, |b| s.branch_name == b))
        .collect();
    if snapshots.is_empty() {
        println!("No snapshots.");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<12} {:<10} {}",
        "ID".bold(),
        "BRANCH".bold(),
        "LABEL".bold(),
        "SIZE".bold(),
        "CREATED".bold()
    );
    for snapshot in snapshots {
        println!(
            "{:<38} {:<24} {:<12} {:<10} {}",
            snapshot.id,
            snapshot.branch_name,
            snapshot.label.as_deref().unwrap_or("-"),
            util::format_size(snapshot.size_bytes),
            util::format_relative_time(snapshot.created_at).dimmed()
        );
    }
    Ok(())
}

pub async fn delete(ctx: &Ctx, id: &str) -> Result<()> {
    let id: Uuid = id.parse().map_err(|_| {
        user_error_with_hint(
            format!("'{}' is not a snapshot id", id),
            "run 'pgbranch snapshot list' for ids",
        )
    })?;

    let state = ctx.store.load_required()?;
    let snapshot = state
        .snapshot_by_id(id)
        .cloned()
        .ok_or_else(|| {
            user_error_with_hint(
                format!("snapshot {} not found", id),
                "run 'pgbranch snapshot list'",
            )
        })?;

    if ctx.zfs.snapshot_exists(&snapshot.zfs_snapshot).await? {
        ctx.zfs.destroy_snapshot(&snapshot.zfs_snapshot).await?;
    }

    ctx.store.update(|s| {
        s.as_mut()
            .context("state file disappeared")?
            .remove_snapshot(id);
        Ok(())
    })?;

    println!("{} Deleted snapshot {}", "✓".green(), snapshot.zfs_snapshot.dimmed());
    Ok(())
}

pub async fn cleanup(
    ctx: &Ctx,
    branch: Option<String>,
    days: Option<i64>,
    dry_run: bool,
    all: bool,
) -> Result<()> {
    let state = ctx.store.load_required()?;

    let branch_id = match &branch {
        Some(name) => Some(
            state
                .branch(name)
                .ok_or_else(|| {
                    user_error_with_hint(
                        format!("branch '{}' not found", name),
                        "run 'pgbranch branch list'",
                    )
                })?
                .id,
        ),
        None => None,
    };

    let candidates: Vec<Snapshot> = if all {
        state
            .snapshots
            .iter()
            .filter(|s| branch_id.map_or(true, |id| s.branch_id == id))
            .cloned()
            .collect()
    } else {
        let cutoff = Utc::now() - Duration::days(days.unwrap_or(DEFAULT_CLEANUP_DAYS));
        state
            .snapshots_older_than(cutoff, branch_id)
            .into_iter()
            .cloned()
            .collect()
    };

    if candidates.is_empty() {
        println!("No snapshots to clean up.");
        return Ok(());
    }

    if dry_run {
        println!("Would delete {} snapshot(s):", candidates.len());
        for snapshot in &candidates {
            println!(
                "  {} ({})",
                snapshot.zfs_snapshot,
                util::format_relative_time(snapshot.created_at)
            );
        }
        return Ok(());
    }

    let mut deleted = Vec::new();
    let mut failures = Vec::new();
    for snapshot in candidates {
        let gone = match ctx.zfs.snapshot_exists(&snapshot.zfs_snapshot).await {
            Ok(true) => ctx.zfs.destroy_snapshot(&snapshot.zfs_snapshot).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        match gone {
            Ok(()) => deleted.push(snapshot.id),
            Err(e) => failures.push(format!("{}: {:#}", snapshot.zfs_snapshot, e)),
        }
    }

    ctx.store.update(|s| {
        let s = s.as_mut().context("state file disappeared")?;
        for id in &deleted {
            s.remove_snapshot(*id);
        }
        Ok(())
    })?;

    println!("{} Deleted {} snapshot(s)", "✓".green(), deleted.len());
    for failure in &failures {
        println!("  {} {}", "✗".red(), failure);
    }
    Ok(())
}

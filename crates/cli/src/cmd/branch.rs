//! Branch operations: create (normal and PITR), delete, reset, lifecycle

use crate::ctx::Ctx;
use crate::rollback::{RollbackAction, RollbackRegistry};
use crate::util;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use owo_colors::OwoColorize;
use pgbranch_docker::ContainerConfig;
use pgbranch_state::{
    user_error_with_hint, Branch, BranchRef, BranchStatus, Project, State, MAIN_BRANCH,
};
use pgbranch_wal::{
    create_consistent_snapshot, parse_recovery_target, select_snapshot_before,
    write_recovery_files,
};
use std::path::Path;
use uuid::Uuid;

pub async fn create(
    ctx: &Ctx,
    target: &str,
    parent: Option<String>,
    pitr: Option<String>,
) -> Result<()> {
    let target_ref = BranchRef::parse(target)?;
    let source_ref = match parent {
        Some(parent) => BranchRef::parse(&parent)?,
        None => BranchRef::new(&target_ref.project, MAIN_BRANCH),
    };
    if source_ref.project != target_ref.project {
        return Err(user_error_with_hint(
            format!(
                "parent '{}' is not in project '{}'",
                source_ref, target_ref.project
            ),
            "a branch can only be created from a branch of the same project",
        ));
    }

    // Parse the recovery target before touching anything.
    let pitr_target = match &pitr {
        Some(input) => Some(parse_recovery_target(input, Utc::now())?),
        None => None,
    };

    let state = ctx.store.load_required()?;
    let project = state
        .project(&target_ref.project)
        .ok_or_else(|| {
            user_error_with_hint(
                format!("project '{}' not found", target_ref.project),
                "run 'pgbranch project list'",
            )
        })?
        .clone();
    let source = state
        .branch(&source_ref.namespaced())
        .ok_or_else(|| {
            user_error_with_hint(
                format!("branch '{}' not found", source_ref),
                "run 'pgbranch branch list'",
            )
        })?
        .clone();
    if state.branch(&target_ref.namespaced()).is_some() {
        return Err(user_error_with_hint(
            format!("branch '{}' already exists", target_ref),
            "pick another branch name",
        ));
    }

    println!(
        "Creating branch '{}' from '{}'...",
        target_ref.to_string().cyan(),
        source_ref
    );

    let mut registry = RollbackRegistry::new();
    let branch = match build_branch(
        ctx,
        &state,
        &project,
        &source,
        &target_ref,
        pitr_target,
        &mut registry,
    )
    .await
    {
        Ok(branch) => branch,
        Err(e) => {
            registry.unwind(ctx.zfs.as_ref(), ctx.docker.as_ref()).await;
            return Err(e);
        }
    };

    let committed = ctx.store.update(|s| {
        s.as_mut()
            .context("state file disappeared")?
            .add_branch(branch.clone())
    });
    if let Err(e) = committed {
        registry.unwind(ctx.zfs.as_ref(), ctx.docker.as_ref()).await;
        return Err(e);
    }
    registry.clear();

    println!();
    println!(
        "{} Created branch '{}' on port {}",
        "✓".green(),
        branch.name.cyan(),
        branch.port.to_string().yellow()
    );
    println!(
        "  Connect: psql -h localhost -p {} -U {} {}",
        branch.port, project.credentials.username, project.credentials.database
    );
    Ok(())
}

async fn build_branch(
    ctx: &Ctx,
    state: &State,
    project: &Project,
    source: &Branch,
    target_ref: &BranchRef,
    pitr_target: Option<DateTime<Utc>>,
    registry: &mut RollbackRegistry,
) -> Result<Branch> {
    let source_dataset_path = ctx.dataset_path(state, &source.zfs_dataset);
    let source_container = BranchRef::parse(&source.name)?.container_name();
    let target_dataset = target_ref.dataset();
    let target_dataset_path = ctx.dataset_path(state, &target_dataset);

    // Pick the snapshot to clone from.
    let full_snapshot = match pitr_target {
        Some(target_time) => {
            // PITR replays onto an existing snapshot; nothing new is
            // created here, so nothing is compensated either.
            let snapshot = select_snapshot_before(state, source, target_time)?;
            println!(
                "  {} recovery base {}",
                "✓".green(),
                snapshot.zfs_snapshot.dimmed()
            );
            snapshot.zfs_snapshot.clone()
        }
        None => {
            let outcome = create_consistent_snapshot(
                ctx.docker.as_ref(),
                ctx.zfs.as_ref(),
                &source_dataset_path,
                source.status,
                &source_container,
                &project.credentials.username,
                &project.credentials.database,
                None,
            )
            .await?;
            registry.add(RollbackAction::DestroySnapshot {
                full_name: outcome.full_snapshot_name.clone(),
            });
            println!(
                "  {} snapshot {}",
                "✓".green(),
                outcome.full_snapshot_name.dimmed()
            );
            outcome.full_snapshot_name
        }
    };

    ctx.zfs
        .clone_snapshot(&full_snapshot, &target_dataset_path)
        .await?;
    registry.add(RollbackAction::DestroyDataset {
        name: target_dataset_path.clone(),
    });
    ctx.zfs.mount_dataset(&target_dataset_path).await?;
    let mountpoint = ctx.zfs.mountpoint(&target_dataset_path).await?;
    println!("  {} clone {}", "✓".green(), target_dataset_path.dimmed());

    // Fresh archive directory; a stale one from an earlier branch of the
    // same name would confuse recovery.
    ctx.wal.delete_archive_dir(&target_dataset)?;
    ctx.wal.ensure_archive_dir(&target_dataset)?;

    let source_archive = ctx.wal.archive_path(&source.zfs_dataset);
    if let Some(target_time) = pitr_target {
        write_recovery_files(Path::new(&mountpoint), &source_archive, Some(target_time))?;
        println!(
            "  {} recovery target {}",
            "✓".green(),
            target_time.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    if !ctx.docker.image_exists(&project.docker_image).await? {
        ctx.docker.pull_image(&project.docker_image).await?;
    }

    // A recovering container reads historical WAL from the source branch's
    // archive; a normal one archives into its own.
    let wal_archive_dir = if pitr_target.is_some() {
        source_archive
    } else {
        ctx.wal.archive_path(&target_dataset)
    };

    let container = ContainerConfig {
        name: target_ref.container_name(),
        image: project.docker_image.clone(),
        username: project.credentials.username.clone(),
        password: project.credentials.password.clone(),
        database: project.credentials.database.clone(),
        data_dir: mountpoint,
        wal_archive_dir: wal_archive_dir.display().to_string(),
        cert_dir: project.ssl_cert_dir.clone(),
        host_port: 0,
    };
    let container_id = ctx.docker.create_container(&container).await?;
    registry.add(RollbackAction::RemoveContainer {
        id: container_id.clone(),
    });
    ctx.docker.start_container(&container_id).await?;
    // In PITR mode this wait also covers WAL replay up to the target.
    ctx.docker
        .wait_for_healthy(&container_id, &project.credentials.username, ctx.ready_timeout())
        .await?;

    let port = ctx.docker.container_port(&container_id).await?;
    let size_bytes = ctx.zfs.used_space(&target_dataset_path).await?;
    println!(
        "  {} container {} (port {})",
        "✓".green(),
        target_ref.container_name().dimmed(),
        port
    );

    Ok(Branch {
        id: Uuid::new_v4(),
        name: target_ref.namespaced(),
        project_name: target_ref.project.clone(),
        parent_branch_id: Some(source.id),
        is_primary: false,
        snapshot_name: Some(full_snapshot),
        zfs_dataset: target_dataset,
        port,
        created_at: Utc::now(),
        size_bytes,
        status: BranchStatus::Running,
    })
}

/// Stop and remove a branch's container and its WAL archive directory.
async fn remove_branch_runtime(ctx: &Ctx, branch: &Branch) -> Result<()> {
    let container_name = BranchRef::parse(&branch.name)?.container_name();
    if let Some(container) = ctx.docker.container_by_name(&container_name).await? {
        if container.status.is_running() {
            if let Err(e) = ctx
                .docker
                .stop_container(&container.id, ctx.stop_timeout())
                .await
            {
                tracing::warn!("stopping {} failed: {:#}", container_name, e);
            }
        }
        ctx.docker.remove_container(&container.id, true).await?;
    }
    ctx.wal.delete_archive_dir(&branch.zfs_dataset)?;
    Ok(())
}

pub async fn delete(ctx: &Ctx, name: &str, force: bool) -> Result<()> {
    let branch_ref = BranchRef::parse(name)?;
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
    if branch.is_primary {
        return Err(user_error_with_hint(
            format!("'{}' is the primary branch", name),
            format!("delete the whole project: 'pgbranch project delete {}'", branch_ref.project),
        ));
    }
    let project = state
        .project(&branch_ref.project)
        .context("project missing for branch")?;

    // Post-order: children first, the branch itself last.
    let doomed: Vec<Branch> = project
        .subtree_post_order(branch.id)
        .into_iter()
        .cloned()
        .collect();
    if doomed.len() > 1 && !force {
        let mut tree = String::new();
        for dependent in &doomed[..doomed.len() - 1] {
            tree.push_str(&format!("\n  {}", dependent.name));
        }
        return Err(user_error_with_hint(
            format!("branch '{}' has dependent branches:{}", name, tree),
            "re-run with --force to delete the whole subtree",
        ));
    }

    println!("Deleting '{}'...", name.cyan());

    // Containers and archives in parallel; dataset order matters below.
    for result in join_all(doomed.iter().map(|b| remove_branch_runtime(ctx, b))).await {
        result?;
    }

    // Child dataset before parent dataset; a missing dataset was reaped by
    // an earlier interrupted delete.
    for doomed_branch in &doomed {
        let path = ctx.dataset_path(&state, &doomed_branch.zfs_dataset);
        if ctx.zfs.dataset_exists(&path).await? {
            ctx.zfs.destroy_dataset(&path, true).await?;
        }
    }

    ctx.store.update(|s| {
        let s = s.as_mut().context("state file disappeared")?;
        for doomed_branch in &doomed {
            s.remove_snapshots_for_branch(doomed_branch.id);
            s.remove_branch(&doomed_branch.name)?;
        }
        Ok(())
    })?;

    for doomed_branch in &doomed {
        println!("  {} {}", "✓".green(), doomed_branch.name);
    }
    Ok(())
}

pub async fn reset(ctx: &Ctx, name: &str, force: bool) -> Result<()> {
    let branch_ref = BranchRef::parse(name)?;
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
    if branch.is_primary {
        return Err(user_error_with_hint(
            format!("'{}' is the primary branch and has no parent to reset to", name),
            "reset only works on branches created from a parent",
        ));
    }
    let project = state
        .project(&branch_ref.project)
        .context("project missing for branch")?
        .clone();
    let parent_id = branch
        .parent_branch_id
        .context("non-primary branch has no parent")?;
    let parent = project
        .branch_by_id(parent_id)
        .context("parent branch not in project")?
        .clone();

    let mut dependents: Vec<Branch> = project
        .subtree_post_order(branch.id)
        .into_iter()
        .cloned()
        .collect();
    dependents.pop(); // the branch itself
    if !dependents.is_empty() && !force {
        let names: Vec<&str> = dependents.iter().map(|b| b.name.as_str()).collect();
        return Err(user_error_with_hint(
            format!(
                "branch '{}' has dependent branches: {}",
                name,
                names.join(", ")
            ),
            "re-run with --force to discard them",
        ));
    }

    println!(
        "Resetting '{}' to '{}'...",
        branch.name.cyan(),
        parent.name
    );

    // Dependents go away entirely; their datasets are clones of this
    // branch's snapshots and fall with the backup dataset below.
    for dependent in &dependents {
        remove_branch_runtime(ctx, dependent).await?;
    }

    if let Some(container) = ctx
        .docker
        .container_by_name(&branch_ref.container_name())
        .await?
    {
        if container.status.is_running() {
            if let Err(e) = ctx
                .docker
                .stop_container(&container.id, ctx.stop_timeout())
                .await
            {
                tracing::warn!("stopping {} failed: {:#}", container.name, e);
            }
        }
        ctx.docker.remove_container(&container.id, true).await?;
    }

    let parent_path = ctx.dataset_path(&state, &parent.zfs_dataset);
    let parent_container = BranchRef::parse(&parent.name)?.container_name();
    let outcome = create_consistent_snapshot(
        ctx.docker.as_ref(),
        ctx.zfs.as_ref(),
        &parent_path,
        parent.status,
        &parent_container,
        &project.credentials.username,
        &project.credentials.database,
        None,
    )
    .await?;
    println!(
        "  {} snapshot {}",
        "✓".green(),
        outcome.full_snapshot_name.dimmed()
    );

    // Clone-then-swap: the old dataset is not destroyed until the
    // replacement has proven mountable.
    let target_path = ctx.dataset_path(&state, &branch.zfs_dataset);
    let temp_path = format!("{}-temp", target_path);
    let backup_path = format!("{}-old", target_path);

    ctx.zfs
        .clone_snapshot(&outcome.full_snapshot_name, &temp_path)
        .await?;
    ctx.zfs.mount_dataset(&temp_path).await?;
    ctx.zfs.unmount_dataset(&target_path).await?;
    ctx.zfs.rename_dataset(&target_path, &backup_path).await?;
    ctx.zfs.unmount_dataset(&temp_path).await?;
    ctx.zfs.rename_dataset(&temp_path, &target_path).await?;
    ctx.zfs.mount_dataset(&target_path).await?;
    if let Err(e) = ctx.zfs.destroy_dataset(&backup_path, true).await {
        tracing::warn!("could not destroy backup dataset {}: {:#}", backup_path, e);
    }
    let mountpoint = ctx.zfs.mountpoint(&target_path).await?;
    println!("  {} dataset swapped", "✓".green());

    // Same permission story as a fresh branch so the new container can
    // archive immediately.
    ctx.wal.ensure_archive_dir(&branch.zfs_dataset)?;

    // Recreate at the same port so clients keep their connection strings.
    let container = ContainerConfig {
        name: branch_ref.container_name(),
        image: project.docker_image.clone(),
        username: project.credentials.username.clone(),
        password: project.credentials.password.clone(),
        database: project.credentials.database.clone(),
        data_dir: mountpoint,
        wal_archive_dir: ctx
            .wal
            .archive_path(&branch.zfs_dataset)
            .display()
            .to_string(),
        cert_dir: project.ssl_cert_dir.clone(),
        host_port: branch.port,
    };
    let container_id = ctx.docker.create_container(&container).await?;
    ctx.docker.start_container(&container_id).await?;
    ctx.docker
        .wait_for_healthy(&container_id, &project.credentials.username, ctx.ready_timeout())
        .await?;
    println!(
        "  {} container recreated (port {})",
        "✓".green(),
        branch.port
    );

    let size_bytes = ctx.zfs.used_space(&target_path).await?;

    ctx.store.update(|s| {
        let s = s.as_mut().context("state file disappeared")?;
        for dependent in &dependents {
            s.remove_snapshots_for_branch(dependent.id);
            s.remove_branch(&dependent.name)?;
        }
        // The branch's own snapshots went down with the old dataset.
        s.remove_snapshots_for_branch(branch.id);
        let b = s
            .branch_mut(&branch.name)
            .context("branch disappeared from state")?;
        b.snapshot_name = Some(outcome.full_snapshot_name.clone());
        b.size_bytes = size_bytes;
        b.status = BranchStatus::Running;
        Ok(())
    })?;

    println!(
        "{} Reset '{}' to '{}' (port {} unchanged)",
        "✓".green(),
        branch.name.cyan(),
        parent.name,
        branch.port
    );
    Ok(())
}

pub async fn list(ctx: &Ctx, project: Option<String>) -> Result<()> {
    let state = match ctx.store.load()? {
        Some(state) => state,
        None => {
            println!("No branches yet.");
            return Ok(());
        }
    };

    if let Some(project_name) = &project {
        if state.project(project_name).is_none() {
            return Err(user_error_with_hint(
                format!("project '{}' not found", project_name),
                "run 'pgbranch project list'",
            ));
        }
    }

    let branches: Vec<&Branch> = state
        .all_branches()
        .filter(|b| project.as_deref().map_or(true, |p| b.project_name == p))
        .collect();
    if branches.is_empty() {
        println!("No branches.");
        return Ok(());
    }

    println!(
        "{:<28} {:<9} {:<7} {:<10} {:<28} {}",
        "NAME".bold(),
        "STATUS".bold(),
        "PORT".bold(),
        "SIZE".bold(),
        "PARENT".bold(),
        "CREATED".bold()
    );
    for branch in branches {
        let parent = branch
            .parent_branch_id
            .and_then(|id| {
                state
                    .project(&branch.project_name)
                    .and_then(|p| p.branch_by_id(id))
            })
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "-".to_string());
        let status = match branch.status {
            BranchStatus::Running => "running".green().to_string(),
            BranchStatus::Stopped => "stopped".red().to_string(),
        };
        println!(
            "{:<28} {:<18} {:<7} {:<10} {:<28} {}",
            branch.name,
            status,
            branch.port,
            util::format_size(branch.size_bytes),
            parent,
            util::format_relative_time(branch.created_at).dimmed()
        );
    }
    Ok(())
}

pub async fn get(ctx: &Ctx, name: &str) -> Result<()> {
    let branch_ref = BranchRef::parse(name)?;
    let state = ctx.store.load_required()?;
    let branch = state.branch(&branch_ref.namespaced()).ok_or_else(|| {
        user_error_with_hint(
            format!("branch '{}' not found", name),
            "run 'pgbranch branch list'",
        )
    })?;

    let status = match branch.status {
        BranchStatus::Running => "running".green().to_string(),
        BranchStatus::Stopped => "stopped".red().to_string(),
    };
    println!("{}", branch.name.cyan().bold());
    println!("  Status:    {}", status);
    println!("  Port:      {}", branch.port);
    println!("  Primary:   {}", branch.is_primary);
    println!(
        "  Dataset:   {}",
        ctx.dataset_path(&state, &branch.zfs_dataset)
    );
    println!("  Container: {}", branch_ref.container_name());
    if let Some(snapshot) = &branch.snapshot_name {
        println!("  Cloned of: {}", snapshot);
    }
    println!("  Size:      {}", util::format_size(branch.size_bytes));
    println!(
        "  Created:   {}",
        util::format_relative_time(branch.created_at)
    );
    Ok(())
}

pub async fn start(ctx: &Ctx, name: &str) -> Result<()> {
    let (branch, project, container) = resolve_runtime(ctx, name).await?;
    if container.status.is_running() {
        println!("'{}' is already running", name);
    } else {
        ctx.docker.start_container(&container.id).await?;
        ctx.docker
            .wait_for_healthy(&container.id, &project.credentials.username, ctx.ready_timeout())
            .await?;
        println!(
            "{} Started '{}' on port {}",
            "✓".green(),
            name.cyan(),
            branch.port
        );
    }
    set_status(ctx, &branch.name, BranchStatus::Running)
}

pub async fn stop(ctx: &Ctx, name: &str) -> Result<()> {
    let (branch, _project, container) = resolve_runtime(ctx, name).await?;
    if !container.status.is_running() {
        println!("'{}' is already stopped", name);
    } else {
        ctx.docker
            .stop_container(&container.id, ctx.stop_timeout())
            .await?;
        println!("{} Stopped '{}'", "✓".green(), name.cyan());
    }
    set_status(ctx, &branch.name, BranchStatus::Stopped)
}

pub async fn restart(ctx: &Ctx, name: &str) -> Result<()> {
    let (branch, project, container) = resolve_runtime(ctx, name).await?;
    ctx.docker.restart_container(&container.id).await?;
    ctx.docker
        .wait_for_healthy(&container.id, &project.credentials.username, ctx.ready_timeout())
        .await?;
    println!(
        "{} Restarted '{}' on port {}",
        "✓".green(),
        name.cyan(),
        branch.port
    );
    set_status(ctx, &branch.name, BranchStatus::Running)
}

pub async fn password(ctx: &Ctx, name: &str) -> Result<()> {
    let branch_ref = BranchRef::parse(name)?;
    let state = ctx.store.load_required()?;
    let branch = state.branch(&branch_ref.namespaced()).ok_or_else(|| {
        user_error_with_hint(
            format!("branch '{}' not found", name),
            "run 'pgbranch branch list'",
        )
    })?;
    let project = state
        .project(&branch.project_name)
        .context("project missing for branch")?;

    println!("Host:     localhost");
    println!("Port:     {}", branch.port);
    println!("User:     {}", project.credentials.username);
    println!("Password: {}", project.credentials.password);
    println!("Database: {}", project.credentials.database);
    println!();
    println!(
        "postgresql://{}:{}@localhost:{}/{}",
        project.credentials.username,
        project.credentials.password,
        branch.port,
        project.credentials.database
    );
    Ok(())
}

async fn resolve_runtime(
    ctx: &Ctx,
    name: &str,
) -> Result<(Branch, Project, pgbranch_docker::ContainerInfo)> {
    let branch_ref = BranchRef::parse(name)?;
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
        .context("project missing for branch")?
        .clone();
    let container = ctx
        .docker
        .container_by_name(&branch_ref.container_name())
        .await?
        .ok_or_else(|| {
            user_error_with_hint(
                format!("container for '{}' is missing", name),
                "run 'pgbranch doctor' to diagnose, or reset the branch",
            )
        })?;
    Ok((branch, project, container))
}

fn set_status(ctx: &Ctx, namespaced: &str, status: BranchStatus) -> Result<()> {
    ctx.store.update(|s| {
        let s = s.as_mut().context("state file disappeared")?;
        let branch = s
            .branch_mut(namespaced)
            .context("branch disappeared from state")?;
        branch.status = status;
        Ok(())
    })?;
    Ok(())
}

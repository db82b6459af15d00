//! Project operations: create, list, get, delete

use crate::ctx::{remove_dir_if_exists, Ctx};
use crate::rollback::{RollbackAction, RollbackRegistry};
use crate::setup;
use crate::util;
use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use owo_colors::OwoColorize;
use pgbranch_docker::ContainerConfig;
use pgbranch_state::{
    user_error_with_hint, validate_name, Branch, BranchRef, BranchStatus, Credentials, Project,
    State, MAIN_BRANCH,
};
use uuid::Uuid;

pub async fn create(
    ctx: &Ctx,
    name: &str,
    pool: Option<String>,
    pg_version: Option<String>,
    image: Option<String>,
) -> Result<()> {
    validate_name(name)?;
    setup::verify_host_setup(ctx).await?;

    if pg_version.is_some() && image.is_some() {
        return Err(user_error_with_hint(
            "--pg-version and --image are mutually exclusive",
            "pass one or the other; --image wins over version shorthand",
        ));
    }
    let image = image.unwrap_or_else(|| match &pg_version {
        Some(v) => format!("postgres:{}-alpine", v),
        None => ctx.config.docker.default_image.clone(),
    });

    let existing = ctx.store.load()?;
    let pool = resolve_pool(ctx, existing.as_ref(), pool).await?;
    setup::verify_pool_access(ctx, &pool).await?;

    let base = existing
        .as_ref()
        .map(|s| s.zfs_dataset_base.clone())
        .unwrap_or_else(|| ctx.config.zfs.dataset_base.clone());

    if let Some(state) = &existing {
        if state.project(name).is_some() {
            return Err(user_error_with_hint(
                format!("project '{}' already exists", name),
                "pick another name or delete the existing project",
            ));
        }
    } else {
        std::fs::create_dir_all(ctx.wal.root())
            .with_context(|| format!("failed to create {}", ctx.wal.root().display()))?;
    }

    println!("Creating project '{}'...", name.cyan());

    let mut registry = RollbackRegistry::new();
    let project = match build_project(ctx, name, &pool, &base, &image, &mut registry).await {
        Ok(project) => project,
        Err(e) => {
            registry.unwind(ctx.zfs.as_ref(), ctx.docker.as_ref()).await;
            return Err(e);
        }
    };

    // Commit under the lock; a concurrent create of the same name fails
    // here and unwinds its own resources.
    let committed = ctx.store.update(|state| {
        let state = state.get_or_insert_with(|| State::new(&pool, &base));
        state.add_project(project.clone())
    });
    if let Err(e) = committed {
        registry.unwind(ctx.zfs.as_ref(), ctx.docker.as_ref()).await;
        return Err(e);
    }
    registry.clear();

    let main = project.primary().expect("created with a primary branch");
    println!();
    println!(
        "{} Created project '{}' ({} on port {})",
        "✓".green(),
        name.cyan(),
        main.name,
        main.port.to_string().yellow()
    );
    println!(
        "  Connect: psql -h localhost -p {} -U {} {}",
        main.port, project.credentials.username, project.credentials.database
    );
    println!("  Password: {}", project.credentials.password);
    Ok(())
}

async fn resolve_pool(
    ctx: &Ctx,
    existing: Option<&State>,
    requested: Option<String>,
) -> Result<String> {
    if let Some(state) = existing {
        if let Some(requested) = requested {
            if requested != state.zfs_pool {
                return Err(user_error_with_hint(
                    format!(
                        "state is initialized on pool '{}', cannot use '{}'",
                        state.zfs_pool, requested
                    ),
                    "omit --pool to use the initialized pool",
                ));
            }
        }
        return Ok(state.zfs_pool.clone());
    }

    match requested {
        Some(pool) => Ok(pool),
        None => {
            let pools = ctx.zfs.list_pools().await?;
            match pools.as_slice() {
                [only] => Ok(only.clone()),
                [] => anyhow::bail!("no zfs pools found"),
                _ => Err(user_error_with_hint(
                    format!("multiple zfs pools found: {}", pools.join(", ")),
                    "choose one with --pool <name>",
                )),
            }
        }
    }
}

async fn build_project(
    ctx: &Ctx,
    name: &str,
    pool: &str,
    base: &str,
    image: &str,
    registry: &mut RollbackRegistry,
) -> Result<Project> {
    let main_ref = BranchRef::new(name, MAIN_BRANCH);
    let dataset = main_ref.dataset();
    let dataset_path = pgbranch_state::full_dataset_path(pool, base, &dataset);

    ctx.zfs
        .create_dataset(&dataset_path, &ctx.dataset_options())
        .await?;
    registry.add(RollbackAction::DestroyDataset {
        name: dataset_path.clone(),
    });
    ctx.zfs.mount_dataset(&dataset_path).await?;
    let mountpoint = ctx.zfs.mountpoint(&dataset_path).await?;
    println!("  {} dataset {}", "✓".green(), dataset_path.dimmed());

    let cert_dir = ctx.cert_dir(name);
    ctx.certs.ensure_project_certs(&cert_dir, name).await?;
    println!("  {} ssl certificate", "✓".green());

    if !ctx.docker.image_exists(image).await? {
        println!("  {} pulling {}...", "→".dimmed(), image.dimmed());
        ctx.docker.pull_image(image).await?;
    }

    ctx.wal.ensure_archive_dir(&dataset)?;

    let credentials = Credentials {
        username: "postgres".to_string(),
        password: util::generate_password(),
        database: "postgres".to_string(),
    };

    let container = ContainerConfig {
        name: main_ref.container_name(),
        image: image.to_string(),
        username: credentials.username.clone(),
        password: credentials.password.clone(),
        database: credentials.database.clone(),
        data_dir: mountpoint,
        wal_archive_dir: ctx.wal.archive_path(&dataset).display().to_string(),
        cert_dir: cert_dir.display().to_string(),
        host_port: 0,
    };
    let container_id = ctx.docker.create_container(&container).await?;
    registry.add(RollbackAction::RemoveContainer {
        id: container_id.clone(),
    });
    ctx.docker.start_container(&container_id).await?;
    ctx.docker
        .wait_for_healthy(&container_id, &credentials.username, ctx.ready_timeout())
        .await?;
    let port = ctx.docker.container_port(&container_id).await?;
    let size_bytes = ctx.zfs.used_space(&dataset_path).await?;
    println!(
        "  {} container {} (port {})",
        "✓".green(),
        main_ref.container_name().dimmed(),
        port
    );

    Ok(Project {
        id: Uuid::new_v4(),
        name: name.to_string(),
        docker_image: image.to_string(),
        ssl_cert_dir: cert_dir.display().to_string(),
        created_at: Utc::now(),
        credentials,
        branches: vec![Branch {
            id: Uuid::new_v4(),
            name: main_ref.namespaced(),
            project_name: name.to_string(),
            parent_branch_id: None,
            is_primary: true,
            snapshot_name: None,
            zfs_dataset: dataset,
            port,
            created_at: Utc::now(),
            size_bytes,
            status: BranchStatus::Running,
        }],
    })
}

pub async fn list(ctx: &Ctx) -> Result<()> {
    let state = match ctx.store.load()? {
        Some(state) => state,
        None => {
            println!("No projects yet. Create one with 'pgbranch project create <name>'.");
            return Ok(());
        }
    };

    if state.projects.is_empty() {
        println!("No projects yet. Create one with 'pgbranch project create <name>'.");
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:<28} {}",
        "NAME".bold(),
        "BRANCHES".bold(),
        "IMAGE".bold(),
        "CREATED".bold()
    );
    for project in &state.projects {
        println!(
            "{:<20} {:<10} {:<28} {}",
            project.name,
            project.branches.len(),
            project.docker_image,
            util::format_relative_time(project.created_at).dimmed()
        );
    }
    Ok(())
}

pub async fn get(ctx: &Ctx, name: &str) -> Result<()> {
    let state = ctx.store.load_required()?;
    let project = state.project(name).ok_or_else(|| {
        user_error_with_hint(
            format!("project '{}' not found", name),
            "run 'pgbranch project list'",
        )
    })?;

    println!("{}", project.name.cyan().bold());
    println!("  Image:    {}", project.docker_image);
    println!("  Certs:    {}", project.ssl_cert_dir);
    println!("  User:     {}", project.credentials.username);
    println!("  Database: {}", project.credentials.database);
    println!(
        "  Created:  {}",
        util::format_relative_time(project.created_at)
    );
    println!("  Branches:");
    if let Some(primary) = project.primary() {
        print_branch_tree(project, primary, 0);
    }
    Ok(())
}

fn print_branch_tree(project: &Project, branch: &Branch, depth: usize) {
    let status = match branch.status {
        BranchStatus::Running => "running".green().to_string(),
        BranchStatus::Stopped => "stopped".red().to_string(),
    };
    println!(
        "    {}{} ({}, port {}, {})",
        "  ".repeat(depth),
        branch.name,
        status,
        branch.port,
        util::format_size(branch.size_bytes)
    );
    for child in project.children_of(branch.id) {
        print_branch_tree(project, child, depth + 1);
    }
}

pub async fn delete(ctx: &Ctx, name: &str, force: bool) -> Result<()> {
    let state = ctx.store.load_required()?;
    let project = state
        .project(name)
        .ok_or_else(|| {
            user_error_with_hint(
                format!("project '{}' not found", name),
                "run 'pgbranch project list'",
            )
        })?
        .clone();

    let non_primary: Vec<&Branch> =
        project.branches.iter().filter(|b| !b.is_primary).collect();
    if !non_primary.is_empty() && !force {
        let names: Vec<&str> = non_primary.iter().map(|b| b.name.as_str()).collect();
        return Err(user_error_with_hint(
            format!(
                "project '{}' still has branches: {}",
                name,
                names.join(", ")
            ),
            "re-run with --force to delete the project and every branch",
        ));
    }

    println!("Deleting project '{}'...", name.cyan());

    // Containers go first, in parallel; they hold the dataset mounts.
    let removals = project.branches.iter().map(|branch| {
        let branch_ref = BranchRef::parse(&branch.name).expect("validated on load");
        async move {
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
            anyhow::Ok(())
        }
    });
    for result in join_all(removals).await {
        result?;
    }
    println!("  {} containers removed", "✓".green());

    // Datasets child-before-parent; missing ones were reaped by an earlier
    // interrupted delete.
    let primary = project.primary().context("project has no primary branch")?;
    for branch in project.subtree_post_order(primary.id) {
        let path = ctx.dataset_path(&state, &branch.zfs_dataset);
        if ctx.zfs.dataset_exists(&path).await? {
            ctx.zfs.destroy_dataset(&path, true).await?;
        }
    }
    println!("  {} datasets destroyed", "✓".green());

    for branch in &project.branches {
        ctx.wal.delete_archive_dir(&branch.zfs_dataset)?;
    }
    remove_dir_if_exists(&ctx.cert_dir(name))?;

    ctx.store.update(|s| {
        let s = s.as_mut().context("state file disappeared")?;
        s.snapshots.retain(|snap| snap.project_name != name);
        s.remove_project(name)?;
        Ok(())
    })?;

    println!("{} Deleted project '{}'", "✓".green(), name);
    Ok(())
}

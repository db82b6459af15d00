//! One-time host setup and its verification
//!
//! Unprivileged operation needs three things on the host: the zfs utilities
//! with `zfs allow` delegation on the pool, a sudoers entry for the mount
//! family (the kernel refuses delegated mounts on Linux), and access to the
//! Docker daemon. `pgbranch setup` puts those in place once and drops a
//! marker; every project create verifies the marker and the live services.

use crate::ctx::Ctx;
use anyhow::{Context, Result};
use pgbranch_state::user_error_with_hint;
use tokio::process::Command;

/// Delegated permissions branch operations need on the pool.
const ZFS_DELEGATIONS: &str = "create,destroy,snapshot,clone,promote,rename,mount,send,hold";

/// Verify the one-time setup has run and the external services respond.
/// Called before any operation that creates resources.
pub async fn verify_host_setup(ctx: &Ctx) -> Result<()> {
    if !ctx.setup_has_run() {
        return Err(user_error_with_hint(
            "host setup has not been run",
            "run 'pgbranch setup' once (requires sudo)",
        ));
    }

    ctx.zfs
        .list_pools()
        .await
        .context("zfs is not available - is ZFS installed?")?;

    ctx.docker
        .list_containers()
        .await
        .context("docker daemon is not reachable - is it running and are you in the docker group?")?;

    Ok(())
}

/// Verify the pool exists and is usable for delegated operations.
pub async fn verify_pool_access(ctx: &Ctx, pool: &str) -> Result<()> {
    if !ctx.zfs.pool_exists(pool).await? {
        return Err(user_error_with_hint(
            format!("zfs pool '{}' does not exist", pool),
            "run 'zpool list' to see available pools",
        ));
    }
    let status = ctx.zfs.pool_status(pool).await?;
    if status.health != "ONLINE" {
        anyhow::bail!("zfs pool '{}' is {} - refusing to continue", pool, status.health);
    }
    Ok(())
}

/// Perform the one-time setup: delegation on the pool, sudoers entry for
/// mounts, WAL archive root. Requires sudo; idempotent.
pub async fn run_setup(ctx: &Ctx, pool: Option<&str>) -> Result<()> {
    let pools = ctx
        .zfs
        .list_pools()
        .await
        .context("zfs is not available - install ZFS first")?;
    let pool = match pool {
        Some(pool) => pool.to_string(),
        None => match pools.as_slice() {
            [only] => only.clone(),
            [] => anyhow::bail!("no zfs pools found - create one first"),
            _ => {
                return Err(user_error_with_hint(
                    format!("multiple zfs pools found: {}", pools.join(", ")),
                    "re-run with 'pgbranch setup --pool <name>'",
                ))
            }
        },
    };

    let user = std::env::var("USER").context("USER environment variable not set")?;

    // Delegate dataset administration to the invoking user.
    run_sudo(&["zfs", "allow", "-u", &user, ZFS_DELEGATIONS, &pool])
        .await
        .context("failed to delegate zfs permissions")?;

    // The kernel ignores delegation for mount(2); allow the mount family
    // through sudo without a password.
    let sudoers_line = format!(
        "{} ALL=(root) NOPASSWD: /usr/sbin/zfs mount *, /usr/sbin/zfs unmount *, /usr/sbin/zfs rename *\n",
        user
    );
    let sudoers_path = "/etc/sudoers.d/pgbranch";
    run_sudo_with_stdin(&["tee", sudoers_path], &sudoers_line)
        .await
        .context("failed to install sudoers entry")?;
    run_sudo(&["chmod", "0440", sudoers_path]).await?;

    std::fs::create_dir_all(ctx.wal.root())
        .with_context(|| format!("failed to create {}", ctx.wal.root().display()))?;

    ctx.docker
        .list_containers()
        .await
        .context("docker daemon is not reachable - add yourself to the docker group and re-login")?;

    ctx.mark_setup_complete()?;
    Ok(())
}

async fn run_sudo(args: &[&str]) -> Result<()> {
    let output = Command::new("sudo")
        .args(args)
        .output()
        .await
        .context("failed to run sudo")?;
    if !output.status.success() {
        anyhow::bail!(
            "sudo {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

async fn run_sudo_with_stdin(args: &[&str], stdin: &str) -> Result<()> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    let mut child = Command::new("sudo")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to run sudo")?;

    if let Some(mut pipe) = child.stdin.take() {
        pipe.write_all(stdin.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        anyhow::bail!(
            "sudo {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

//! `zfs`/`zpool` subprocess implementation of the driver trait

use crate::exec::{run, run_checked};
use crate::{DatasetInfo, DatasetOptions, PoolStatus, ZfsDriver};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Driver backed by the system zfs utilities.
///
/// Dataset creation, snapshotting and cloning run unprivileged through
/// `zfs allow` delegation. The kernel refuses delegated mounts on Linux, so
/// mount/unmount/rename go through `sudo -n` - the one-time setup installs
/// the matching sudoers entry.
pub struct Zfs {
    sudo_mounts: bool,
}

impl Zfs {
    pub fn new() -> Self {
        Self { sudo_mounts: true }
    }

    /// Used by doctor to probe delegation without sudo.
    pub fn without_sudo() -> Self {
        Self { sudo_mounts: false }
    }

    async fn zfs(&self, args: &[&str]) -> Result<String> {
        run_checked("zfs", args).await
    }

    async fn zfs_privileged(&self, args: &[&str]) -> Result<crate::exec::CmdOutput> {
        if self.sudo_mounts {
            let mut full = vec!["-n", "zfs"];
            full.extend_from_slice(args);
            run("sudo", &full).await
        } else {
            run("zfs", args).await
        }
    }
}

impl Default for Zfs {
    fn default() -> Self {
        Self::new()
    }
}

/// zfs create may report success while refusing to mount for an
/// unprivileged caller. That message is not a failure.
fn created_but_unmountable(stderr: &str) -> bool {
    stderr.contains("successfully created") && stderr.contains("only be mounted by root")
}

fn already_mounted(stderr: &str) -> bool {
    stderr.contains("already mounted")
}

fn not_mounted(stderr: &str) -> bool {
    stderr.contains("not currently mounted") || stderr.contains("not mounted")
}

fn parse_bytes(field: &str, line: &str) -> Result<u64> {
    field
        .parse()
        .with_context(|| format!("unparseable zfs numeric output '{}' in '{}'", field, line))
}

fn parse_dataset_line(line: &str) -> Result<DatasetInfo> {
    // zfs list -Hp -o name,used,avail,refer,mountpoint,creation
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 6 {
        anyhow::bail!("unexpected zfs list output: '{}'", line);
    }
    let mountpoint = match fields[4] {
        "-" | "none" | "legacy" => None,
        path => Some(path.to_string()),
    };
    let created = fields[5]
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    Ok(DatasetInfo {
        name: fields[0].to_string(),
        used_bytes: parse_bytes(fields[1], line)?,
        avail_bytes: parse_bytes(fields[2], line)?,
        refer_bytes: parse_bytes(fields[3], line)?,
        mountpoint,
        created,
    })
}

#[async_trait]
impl ZfsDriver for Zfs {
    async fn list_pools(&self) -> Result<Vec<String>> {
        let out = run_checked("zpool", &["list", "-H", "-o", "name"]).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn pool_exists(&self, pool: &str) -> Result<bool> {
        let out = run("zpool", &["list", "-H", "-o", "name", pool]).await?;
        Ok(out.status_ok)
    }

    async fn pool_status(&self, pool: &str) -> Result<PoolStatus> {
        let out = run_checked(
            "zpool",
            &["list", "-Hp", "-o", "health,size,allocated,free", pool],
        )
        .await?;
        let fields: Vec<&str> = out.split('\t').collect();
        if fields.len() != 4 {
            anyhow::bail!("unexpected zpool list output: '{}'", out);
        }
        Ok(PoolStatus {
            health: fields[0].to_string(),
            size_bytes: parse_bytes(fields[1], &out)?,
            allocated_bytes: parse_bytes(fields[2], &out)?,
            free_bytes: parse_bytes(fields[3], &out)?,
        })
    }

    async fn create_dataset(&self, name: &str, options: &DatasetOptions) -> Result<()> {
        let compression = format!("compression={}", options.compression);
        let recordsize = format!("recordsize={}", options.recordsize);
        let atime = format!("atime={}", if options.atime_off { "off" } else { "on" });
        let out = run(
            "zfs",
            &[
                "create", "-p", "-o", &compression, "-o", &recordsize, "-o", &atime, name,
            ],
        )
        .await?;
        if out.status_ok || created_but_unmountable(&out.stderr) {
            return Ok(());
        }
        anyhow::bail!("zfs create {} failed: {}", name, out.stderr)
    }

    async fn destroy_dataset(&self, name: &str, recursive: bool) -> Result<()> {
        // -R tears down clones of the dataset's snapshots as well.
        if recursive {
            self.zfs(&["destroy", "-R", name]).await?;
        } else {
            self.zfs(&["destroy", name]).await?;
        }
        Ok(())
    }

    async fn dataset_exists(&self, name: &str) -> Result<bool> {
        let out = run("zfs", &["list", "-H", "-o", "name", name]).await?;
        Ok(out.status_ok)
    }

    async fn get_dataset(&self, name: &str) -> Result<DatasetInfo> {
        let out = self
            .zfs(&[
                "list",
                "-Hp",
                "-o",
                "name,used,avail,refer,mountpoint,creation",
                name,
            ])
            .await?;
        parse_dataset_line(&out)
    }

    async fn list_datasets(&self, base: &str) -> Result<Vec<DatasetInfo>> {
        let out = run(
            "zfs",
            &[
                "list",
                "-Hp",
                "-r",
                "-t",
                "filesystem",
                "-o",
                "name,used,avail,refer,mountpoint,creation",
                base,
            ],
        )
        .await?;
        if !out.status_ok {
            // Base not created yet means nothing to list.
            if out.stderr.contains("does not exist") {
                return Ok(Vec::new());
            }
            anyhow::bail!("zfs list -r {} failed: {}", base, out.stderr);
        }
        out.stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(parse_dataset_line)
            .filter(|r| r.as_ref().map(|d| d.name != base).unwrap_or(true))
            .collect()
    }

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        let pair = format!("{}={}", key, value);
        self.zfs(&["set", &pair, dataset]).await?;
        Ok(())
    }

    async fn get_property(&self, dataset: &str, key: &str) -> Result<String> {
        self.zfs(&["get", "-H", "-o", "value", key, dataset]).await
    }

    async fn mount_dataset(&self, name: &str) -> Result<()> {
        let out = self.zfs_privileged(&["mount", name]).await?;
        if out.status_ok || already_mounted(&out.stderr) {
            return Ok(());
        }
        anyhow::bail!("zfs mount {} failed: {}", name, out.stderr)
    }

    async fn unmount_dataset(&self, name: &str) -> Result<()> {
        let out = self.zfs_privileged(&["unmount", name]).await?;
        if out.status_ok || not_mounted(&out.stderr) {
            return Ok(());
        }
        anyhow::bail!("zfs unmount {} failed: {}", name, out.stderr)
    }

    async fn rename_dataset(&self, from: &str, to: &str) -> Result<()> {
        let out = self.zfs_privileged(&["rename", from, to]).await?;
        if !out.status_ok {
            anyhow::bail!("zfs rename {} {} failed: {}", from, to, out.stderr);
        }
        Ok(())
    }

    async fn mountpoint(&self, name: &str) -> Result<String> {
        let value = self.get_property(name, "mountpoint").await?;
        match value.as_str() {
            "-" | "none" | "legacy" => {
                anyhow::bail!("dataset {} has no usable mountpoint", name)
            }
            path => Ok(path.to_string()),
        }
    }

    async fn used_space(&self, name: &str) -> Result<u64> {
        let out = self.zfs(&["list", "-Hp", "-o", "used", name]).await?;
        parse_bytes(out.trim(), &out)
    }

    async fn create_snapshot(&self, dataset: &str, stamp: &str) -> Result<String> {
        let full = format!("{}@{}", dataset, stamp);
        self.zfs(&["snapshot", &full]).await?;
        Ok(full)
    }

    async fn destroy_snapshot(&self, full_name: &str) -> Result<()> {
        self.zfs(&["destroy", full_name]).await?;
        Ok(())
    }

    async fn snapshot_exists(&self, full_name: &str) -> Result<bool> {
        let out = run(
            "zfs",
            &["list", "-H", "-t", "snapshot", "-o", "name", full_name],
        )
        .await?;
        Ok(out.status_ok)
    }

    async fn list_snapshots(&self, dataset: Option<&str>) -> Result<Vec<String>> {
        let mut args = vec!["list", "-H", "-t", "snapshot", "-o", "name"];
        if let Some(dataset) = dataset {
            args.push("-r");
            args.push(dataset);
        }
        let out = run("zfs", &args).await?;
        if !out.status_ok {
            if out.stderr.contains("does not exist") {
                return Ok(Vec::new());
            }
            anyhow::bail!("zfs list -t snapshot failed: {}", out.stderr);
        }
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn snapshot_size(&self, full_name: &str) -> Result<u64> {
        let out = self
            .zfs(&["list", "-Hp", "-t", "snapshot", "-o", "used", full_name])
            .await?;
        parse_bytes(out.trim(), &out)
    }

    async fn clone_snapshot(&self, full_snapshot: &str, target_dataset: &str) -> Result<()> {
        self.zfs(&["clone", full_snapshot, target_dataset]).await?;
        Ok(())
    }

    async fn promote_clone(&self, dataset: &str) -> Result<()> {
        self.zfs(&["promote", dataset]).await?;
        Ok(())
    }
}

//! Application-consistent snapshots
//!
//! A bare zfs snapshot of a running instance is only crash-consistent:
//! opening it would replay WAL. Forcing a CHECKPOINT first flushes every
//! dirty buffer, so the snapshot taken right after opens clean. The
//! CHECKPOINT and the snapshot must not be separated by unrelated await
//! points.

use anyhow::{Context, Result};
use chrono::Utc;
use pgbranch_docker::ContainerDriver;
use pgbranch_state::{snapshot_stamp, BranchStatus};
use pgbranch_zfs::ZfsDriver;

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    /// The stamp component after `@`.
    pub snapshot_name: String,
    /// The fully-qualified `<dataset>@<stamp>` name.
    pub full_snapshot_name: String,
}

/// Take an application-consistent snapshot of a branch dataset.
///
/// For a running branch the instance is checkpointed through its container
/// first; a stopped branch is already consistent on disk.
pub async fn create_consistent_snapshot(
    docker: &dyn ContainerDriver,
    zfs: &dyn ZfsDriver,
    dataset_path: &str,
    status: BranchStatus,
    container_name: &str,
    username: &str,
    database: &str,
    label: Option<&str>,
) -> Result<SnapshotOutcome> {
    if status.is_running() {
        let container = docker
            .container_by_name(container_name)
            .await?
            .with_context(|| {
                format!("container '{}' not found for running branch", container_name)
            })?;
        docker
            .exec_sql(&container.id, "CHECKPOINT;", username, database)
            .await
            .context("CHECKPOINT failed")?;
    }

    // CHECKPOINT happens-before the snapshot; nothing may run in between.
    let stamp = snapshot_stamp(Utc::now(), label);
    let full = zfs
        .create_snapshot(dataset_path, &stamp)
        .await
        .with_context(|| format!("failed to snapshot {}", dataset_path))?;

    Ok(SnapshotOutcome {
        snapshot_name: stamp,
        full_snapshot_name: full,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgbranch_docker::testing::MemDocker;
    use pgbranch_docker::ContainerConfig;
    use pgbranch_zfs::testing::MemZfs;
    use pgbranch_zfs::DatasetOptions;
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, MemZfs, MemDocker, String) {
        let temp = TempDir::new().unwrap();
        let zfs = MemZfs::new(temp.path().join("zfs"));
        zfs.create_dataset("tank/pg/demo-main", &DatasetOptions::default())
            .await
            .unwrap();

        let docker = MemDocker::new();
        let id = docker
            .create_container(&ContainerConfig {
                name: "pgbranch-demo-main".into(),
                image: "postgres:17-alpine".into(),
                username: "postgres".into(),
                password: "pw".into(),
                database: "postgres".into(),
                data_dir: "/d".into(),
                wal_archive_dir: "/w".into(),
                cert_dir: "/c".into(),
                host_port: 0,
            })
            .await
            .unwrap();
        docker.start_container(&id).await.unwrap();
        (temp, zfs, docker, id)
    }

    #[tokio::test]
    async fn test_running_branch_checkpoints_first() {
        let (_temp, zfs, docker, _id) = fixture().await;

        let outcome = create_consistent_snapshot(
            &docker,
            &zfs,
            "tank/pg/demo-main",
            BranchStatus::Running,
            "pgbranch-demo-main",
            "postgres",
            "postgres",
            Some("t1"),
        )
        .await
        .unwrap();

        assert_eq!(
            docker.sql_log(),
            vec![("pgbranch-demo-main".to_string(), "CHECKPOINT;".to_string())]
        );
        assert!(outcome.snapshot_name.ends_with("-t1"));
        assert!(outcome
            .full_snapshot_name
            .starts_with("tank/pg/demo-main@"));
        assert!(zfs.snapshot_exists(&outcome.full_snapshot_name).await.unwrap());
    }

    #[tokio::test]
    async fn test_stopped_branch_skips_checkpoint() {
        let (_temp, zfs, docker, _id) = fixture().await;

        create_consistent_snapshot(
            &docker,
            &zfs,
            "tank/pg/demo-main",
            BranchStatus::Stopped,
            "pgbranch-demo-main",
            "postgres",
            "postgres",
            None,
        )
        .await
        .unwrap();

        assert!(docker.sql_log().is_empty());
        assert_eq!(zfs.snapshot_names().len(), 1);
    }

    #[tokio::test]
    async fn test_running_branch_without_container_fails() {
        let (_temp, zfs, docker, _id) = fixture().await;

        let err = create_consistent_snapshot(
            &docker,
            &zfs,
            "tank/pg/demo-main",
            BranchStatus::Running,
            "pgbranch-demo-ghost",
            "postgres",
            "postgres",
            None,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("not found"));
        // No snapshot may exist after the failure.
        assert!(zfs.snapshot_names().is_empty());
    }
}

//! Controller integration tests over in-memory drivers
//!
//! These exercise the same command functions the binary dispatches to,
//! asserting the externally observable invariants: what exists in the fake
//! ZFS and Docker after each operation, and what the state file says.

mod common;

use common::{create_branch, create_project, fixture, load_state, state_bytes};
use pgbranch_cli::{cmd, orphan};
use pgbranch_docker::ContainerDriver;
use pgbranch_state::{BranchStatus, UserError};
use pgbranch_zfs::ZfsDriver;

fn is_user_error(e: &anyhow::Error) -> bool {
    e.downcast_ref::<UserError>().is_some()
}

// ---------------------------------------------------------------------------
// project create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_project_create_provisions_everything() {
    let f = fixture();
    create_project(&f, "demo").await;

    let state = load_state(&f);
    assert_eq!(state.zfs_pool, "tank");
    assert_eq!(state.zfs_dataset_base, "pgbranch");

    let project = state.project("demo").unwrap();
    let main = project.primary().unwrap();
    assert_eq!(main.name, "demo/main");
    assert!(main.is_primary);
    assert!(main.parent_branch_id.is_none());
    assert_eq!(main.status, BranchStatus::Running);
    assert!(main.port > 0);

    assert!(f.zfs.dataset_exists("tank/pgbranch/demo-main").await.unwrap());
    assert!(f.zfs.is_mounted("tank/pgbranch/demo-main"));
    assert!(f.docker.container_exists("pgbranch-demo-main").await.unwrap());

    // WAL archive prepared for the primary.
    assert!(f
        .ctx
        .wal
        .archive_path("demo-main")
        .join(".keep")
        .exists());
}

#[tokio::test]
async fn test_project_create_duplicate_rejected() {
    let f = fixture();
    create_project(&f, "demo").await;

    let err = cmd::project::create(&f.ctx, "demo", None, None, None)
        .await
        .unwrap_err();
    assert!(is_user_error(&err));
    assert!(err.to_string().contains("already exists"));

    let state = load_state(&f);
    assert_eq!(state.projects.len(), 1);
    assert_eq!(state.projects[0].branches.len(), 1);
}

#[tokio::test]
async fn test_project_create_invalid_name_rejected_before_side_effects() {
    let f = fixture();
    let err = cmd::project::create(&f.ctx, "bad name!", None, None, None)
        .await
        .unwrap_err();
    assert!(is_user_error(&err));
    assert!(f.zfs.dataset_names().is_empty());
    assert!(f.docker.container_names().is_empty());
}

#[tokio::test]
async fn test_project_create_image_and_version_conflict() {
    let f = fixture();
    let err = cmd::project::create(
        &f.ctx,
        "demo",
        None,
        Some("16".into()),
        Some("postgres:16".into()),
    )
    .await
    .unwrap_err();
    assert!(is_user_error(&err));
}

#[tokio::test]
async fn test_project_create_requires_setup() {
    let f = fixture();
    std::fs::remove_file(f.ctx.setup_marker()).unwrap();

    let err = cmd::project::create(&f.ctx, "demo", None, None, None)
        .await
        .unwrap_err();
    assert!(is_user_error(&err));
    assert!(err.to_string().contains("setup"));
}

#[tokio::test]
async fn test_project_create_failure_unwinds() {
    let f = fixture();
    f.docker.fail_once("wait_for_healthy");

    let err = cmd::project::create(&f.ctx, "demo", None, None, None)
        .await
        .unwrap_err();
    assert!(!is_user_error(&err));

    assert!(f.zfs.dataset_names().is_empty());
    assert!(f.docker.container_names().is_empty());
    assert!(f.ctx.store.load().unwrap().is_none());
}

// ---------------------------------------------------------------------------
// branch create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_branch_create_clones_and_starts() {
    let f = fixture();
    create_project(&f, "demo").await;
    f.zfs.set_used_bytes("tank/pgbranch/demo-main", 9_699_328);

    create_branch(&f, "demo/dev").await;

    let state = load_state(&f);
    let dev = state.branch("demo/dev").unwrap();
    let main = state.branch("demo/main").unwrap();
    assert_eq!(dev.parent_branch_id, Some(main.id));
    let parent_used = f
        .zfs
        .get_dataset("tank/pgbranch/demo-main")
        .await
        .unwrap()
        .used_bytes;
    assert!(!dev.is_primary);
    assert_eq!(dev.status, BranchStatus::Running);
    assert!(dev.snapshot_name.as_deref().unwrap().starts_with("tank/pgbranch/demo-main@"));

    assert!(f.zfs.dataset_exists("tank/pgbranch/demo-dev").await.unwrap());
    assert!(f.zfs.is_mounted("tank/pgbranch/demo-dev"));
    assert!(f.docker.container_exists("pgbranch-demo-dev").await.unwrap());

    // CHECKPOINT ran against the parent before the snapshot.
    let sql = f.docker.sql_log();
    assert_eq!(sql.len(), 1);
    assert_eq!(sql[0].0, "pgbranch-demo-main");
    assert_eq!(sql[0].1, "CHECKPOINT;");

    // Copy-on-write: the fresh branch is a sliver of its parent.
    assert!(dev.size_bytes * 10 < parent_used);

    // The new branch archives into its own directory.
    assert_eq!(
        f.docker.wal_archive_dir_of("pgbranch-demo-dev").unwrap(),
        f.ctx.wal.archive_path("demo-dev").display().to_string()
    );
}

#[tokio::test]
async fn test_branch_create_failure_unwinds_completely() {
    let f = fixture();
    create_project(&f, "demo").await;

    let datasets_before = f.zfs.dataset_names();
    let containers_before = f.docker.container_names();
    let state_before = state_bytes(&f);

    f.docker.fail_once("wait_for_healthy");
    let err = cmd::branch::create(&f.ctx, "demo/dev", None, None)
        .await
        .unwrap_err();
    assert!(!is_user_error(&err));

    // No dataset, container or snapshot from the attempt remains, and the
    // state file is byte-identical.
    assert_eq!(f.zfs.dataset_names(), datasets_before);
    assert_eq!(f.docker.container_names(), containers_before);
    assert!(f.zfs.snapshot_names().is_empty());
    assert_eq!(state_bytes(&f), state_before);
}

#[tokio::test]
async fn test_branch_create_rejects_duplicate_and_bad_parent() {
    let f = fixture();
    create_project(&f, "demo").await;
    create_project(&f, "other").await;
    create_branch(&f, "demo/dev").await;

    let datasets_before = f.zfs.dataset_names();

    let err = cmd::branch::create(&f.ctx, "demo/dev", None, None)
        .await
        .unwrap_err();
    assert!(is_user_error(&err));

    // Cross-project parent is rejected before any side effect.
    let err = cmd::branch::create(&f.ctx, "demo/x", Some("other/main".into()), None)
        .await
        .unwrap_err();
    assert!(is_user_error(&err));

    let err = cmd::branch::create(&f.ctx, "nodashes", None, None)
        .await
        .unwrap_err();
    assert!(is_user_error(&err));

    assert_eq!(f.zfs.dataset_names(), datasets_before);
}

#[tokio::test]
async fn test_branch_create_missing_source_rejected() {
    let f = fixture();
    create_project(&f, "demo").await;

    let err = cmd::branch::create(&f.ctx, "demo/x", Some("demo/ghost".into()), None)
        .await
        .unwrap_err();
    assert!(is_user_error(&err));
    assert!(err.to_string().contains("not found"));
}

// ---------------------------------------------------------------------------
// branch delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_branch_delete_cascade() {
    let f = fixture();
    create_project(&f, "api").await;
    create_branch(&f, "api/dev").await;
    cmd::branch::create(&f.ctx, "api/feature", Some("api/dev".into()), None)
        .await
        .unwrap();

    // Without --force the dependents block the delete and are listed.
    let err = cmd::branch::delete(&f.ctx, "api/dev", false).await.unwrap_err();
    assert!(is_user_error(&err));
    assert!(err.to_string().contains("api/feature"));

    cmd::branch::delete(&f.ctx, "api/dev", true).await.unwrap();

    let state = load_state(&f);
    let names: Vec<&str> = state.all_branches().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["api/main"]);

    assert!(!f.zfs.dataset_exists("tank/pgbranch/api-dev").await.unwrap());
    assert!(!f.zfs.dataset_exists("tank/pgbranch/api-feature").await.unwrap());
    assert!(!f.docker.container_exists("pgbranch-api-dev").await.unwrap());
    assert!(!f.docker.container_exists("pgbranch-api-feature").await.unwrap());
    assert!(!f.ctx.wal.archive_path("api-dev").exists());
}

#[tokio::test]
async fn test_branch_delete_twice_is_clean_not_found() {
    let f = fixture();
    create_project(&f, "demo").await;
    create_branch(&f, "demo/dev").await;

    cmd::branch::delete(&f.ctx, "demo/dev", false).await.unwrap();
    let err = cmd::branch::delete(&f.ctx, "demo/dev", false)
        .await
        .unwrap_err();
    assert!(is_user_error(&err));
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn test_primary_branch_cannot_be_deleted() {
    let f = fixture();
    create_project(&f, "demo").await;

    let err = cmd::branch::delete(&f.ctx, "demo/main", true).await.unwrap_err();
    assert!(is_user_error(&err));
}

// ---------------------------------------------------------------------------
// branch reset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_branch_reset_swaps_dataset_and_keeps_port() {
    let f = fixture();
    create_project(&f, "demo").await;
    create_branch(&f, "demo/dev").await;

    let port_before = load_state(&f).branch("demo/dev").unwrap().port;

    // A recorded snapshot of dev should disappear with the reset.
    cmd::snapshot::create(&f.ctx, "demo/dev", Some("before".into()))
        .await
        .unwrap();
    assert_eq!(load_state(&f).snapshots.len(), 1);

    cmd::branch::reset(&f.ctx, "demo/dev", false).await.unwrap();

    let state = load_state(&f);
    let dev = state.branch("demo/dev").unwrap();
    assert_eq!(dev.port, port_before);
    assert_eq!(dev.status, BranchStatus::Running);
    assert!(state.snapshots.is_empty());

    // Swap left neither temp nor backup behind.
    assert!(f.zfs.dataset_exists("tank/pgbranch/demo-dev").await.unwrap());
    assert!(f.zfs.is_mounted("tank/pgbranch/demo-dev"));
    assert!(!f.zfs.dataset_exists("tank/pgbranch/demo-dev-temp").await.unwrap());
    assert!(!f.zfs.dataset_exists("tank/pgbranch/demo-dev-old").await.unwrap());

    // Container recreated on the same port.
    let container = f
        .docker
        .container_by_name("pgbranch-demo-dev")
        .await
        .unwrap()
        .unwrap();
    assert!(container.status.is_running());
    assert_eq!(
        f.docker.container_port(&container.id).await.unwrap(),
        port_before
    );
}

#[tokio::test]
async fn test_branch_reset_primary_rejected() {
    let f = fixture();
    create_project(&f, "demo").await;

    let err = cmd::branch::reset(&f.ctx, "demo/main", false).await.unwrap_err();
    assert!(is_user_error(&err));
}

#[tokio::test]
async fn test_branch_reset_with_dependents_requires_force() {
    let f = fixture();
    create_project(&f, "demo").await;
    create_branch(&f, "demo/dev").await;
    cmd::branch::create(&f.ctx, "demo/feature", Some("demo/dev".into()), None)
        .await
        .unwrap();

    let err = cmd::branch::reset(&f.ctx, "demo/dev", false).await.unwrap_err();
    assert!(is_user_error(&err));
    assert!(err.to_string().contains("demo/feature"));

    cmd::branch::reset(&f.ctx, "demo/dev", true).await.unwrap();

    let state = load_state(&f);
    assert!(state.branch("demo/feature").is_none());
    assert!(!f.zfs.dataset_exists("tank/pgbranch/demo-feature").await.unwrap());
    assert!(!f.docker.container_exists("pgbranch-demo-feature").await.unwrap());
}

// ---------------------------------------------------------------------------
// PITR
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pitr_uses_existing_snapshot_and_source_archive() {
    let f = fixture();
    create_project(&f, "db").await;
    cmd::snapshot::create(&f.ctx, "db/main", Some("t1".into()))
        .await
        .unwrap();
    let snapshots_before = f.zfs.snapshot_names();

    let target = (chrono::Utc::now() + chrono::Duration::minutes(1)).to_rfc3339();
    cmd::branch::create(&f.ctx, "db/recovered", None, Some(target))
        .await
        .unwrap();

    // No new snapshot was created for the clone.
    assert_eq!(f.zfs.snapshot_names(), snapshots_before);

    // Recovery files landed in the clone's pgdata.
    let mountpoint = f.zfs.mountpoint_of("tank/pgbranch/db-recovered");
    assert!(std::path::Path::new(&mountpoint)
        .join("pgdata/recovery.signal")
        .exists());
    let conf = std::fs::read_to_string(
        std::path::Path::new(&mountpoint).join("pgdata/postgresql.auto.conf"),
    )
    .unwrap();
    assert!(conf.contains("recovery_target_action = 'promote'"));
    assert!(conf.contains(&format!(
        "restore_command = 'cp {}/%f %p'",
        f.ctx.wal.archive_path("db-main").display()
    )));

    // The recovering container mounts the source branch's archive.
    assert_eq!(
        f.docker.wal_archive_dir_of("pgbranch-db-recovered").unwrap(),
        f.ctx.wal.archive_path("db-main").display().to_string()
    );
}

#[tokio::test]
async fn test_pitr_before_oldest_snapshot_is_user_error() {
    let f = fixture();
    create_project(&f, "db").await;
    cmd::snapshot::create(&f.ctx, "db/main", None).await.unwrap();

    let datasets_before = f.zfs.dataset_names();
    let err = cmd::branch::create(&f.ctx, "db/recovered", None, Some("1 week ago".into()))
        .await
        .unwrap_err();
    assert!(is_user_error(&err));
    assert!(err.to_string().contains("no snapshot"));

    // No clone was attempted.
    assert_eq!(f.zfs.dataset_names(), datasets_before);
}

#[tokio::test]
async fn test_pitr_garbage_time_rejected_before_load() {
    let f = fixture();
    let err = cmd::branch::create(&f.ctx, "db/x", None, Some("yesterday-ish".into()))
        .await
        .unwrap_err();
    assert!(is_user_error(&err));
}

// ---------------------------------------------------------------------------
// snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_snapshot_create_records_state() {
    let f = fixture();
    create_project(&f, "demo").await;

    cmd::snapshot::create(&f.ctx, "demo/main", Some("t1".into()))
        .await
        .unwrap();

    let state = load_state(&f);
    assert_eq!(state.snapshots.len(), 1);
    let record = &state.snapshots[0];
    assert_eq!(record.branch_name, "demo/main");
    assert_eq!(record.label.as_deref(), Some("t1"));
    assert!(record.zfs_snapshot.ends_with("-t1"));
    assert!(f.zfs.snapshot_exists(&record.zfs_snapshot).await.unwrap());
}

#[tokio::test]
async fn test_snapshot_delete_removes_both_sides() {
    let f = fixture();
    create_project(&f, "demo").await;
    cmd::snapshot::create(&f.ctx, "demo/main", None).await.unwrap();

    let state = load_state(&f);
    let id = state.snapshots[0].id.to_string();
    let full_name = state.snapshots[0].zfs_snapshot.clone();

    cmd::snapshot::delete(&f.ctx, &id).await.unwrap();
    assert!(load_state(&f).snapshots.is_empty());
    assert!(!f.zfs.snapshot_exists(&full_name).await.unwrap());
}

#[tokio::test]
async fn test_snapshot_cleanup_all_dry_run() {
    let f = fixture();
    create_project(&f, "demo").await;
    cmd::snapshot::create(&f.ctx, "demo/main", Some("a".into()))
        .await
        .unwrap();
    cmd::snapshot::create(&f.ctx, "demo/main", Some("b".into()))
        .await
        .unwrap();

    // Dry run deletes nothing.
    cmd::snapshot::cleanup(&f.ctx, None, None, true, true)
        .await
        .unwrap();
    assert_eq!(load_state(&f).snapshots.len(), 2);

    // --all sweeps regardless of age.
    cmd::snapshot::cleanup(&f.ctx, None, None, false, true)
        .await
        .unwrap();
    assert!(load_state(&f).snapshots.is_empty());
    assert!(f.zfs.snapshot_names().is_empty());
}

// ---------------------------------------------------------------------------
// lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_branch_stop_start_updates_status() {
    let f = fixture();
    create_project(&f, "demo").await;
    create_branch(&f, "demo/dev").await;

    cmd::branch::stop(&f.ctx, "demo/dev").await.unwrap();
    assert_eq!(
        load_state(&f).branch("demo/dev").unwrap().status,
        BranchStatus::Stopped
    );

    cmd::branch::start(&f.ctx, "demo/dev").await.unwrap();
    assert_eq!(
        load_state(&f).branch("demo/dev").unwrap().status,
        BranchStatus::Running
    );
}

// ---------------------------------------------------------------------------
// project delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_project_delete_requires_force_with_branches() {
    let f = fixture();
    create_project(&f, "demo").await;
    create_branch(&f, "demo/dev").await;

    let err = cmd::project::delete(&f.ctx, "demo", false).await.unwrap_err();
    assert!(is_user_error(&err));

    cmd::project::delete(&f.ctx, "demo", true).await.unwrap();
    let state = load_state(&f);
    assert!(state.projects.is_empty());
    assert!(f.docker.container_names().is_empty());
    // Only the base-level ghosts of the fake remain: nothing under base.
    assert!(f
        .zfs
        .dataset_names()
        .iter()
        .all(|d| !d.starts_with("tank/pgbranch/")));
}

// ---------------------------------------------------------------------------
// orphan detection and cleanup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_orphan_detection_exactness() {
    let f = fixture();
    create_project(&f, "api").await;
    create_branch(&f, "api/dev").await;

    f.zfs.plant_dataset("tank/pgbranch/ghost", 4096);
    f.docker.plant_container("pgbranch-ghost");
    // A container without our prefix is somebody else's business.
    f.docker.plant_container("unrelated-db");

    let state = load_state(&f);
    let report = orphan::detect(&f.ctx, &state).await.unwrap();

    let dataset_names: Vec<&str> = report.datasets.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(dataset_names, vec!["tank/pgbranch/ghost"]);
    let container_names: Vec<&str> =
        report.containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(container_names, vec!["pgbranch-ghost"]);
    assert_eq!(report.total_orphans(), 2);
    assert!(report.total_wasted_bytes > 0);
}

#[tokio::test]
async fn test_cleanup_removes_orphans() {
    let f = fixture();
    create_project(&f, "api").await;
    f.zfs.plant_dataset("tank/pgbranch/ghost", 4096);
    f.docker.plant_container("pgbranch-ghost");

    // Dry run leaves everything alone.
    cmd::cleanup::run(&f.ctx, true, false).await.unwrap();
    assert!(f.zfs.dataset_exists("tank/pgbranch/ghost").await.unwrap());

    cmd::cleanup::run(&f.ctx, false, true).await.unwrap();
    assert!(!f.zfs.dataset_exists("tank/pgbranch/ghost").await.unwrap());
    assert!(!f.docker.container_exists("pgbranch-ghost").await.unwrap());

    // Tracked resources survive.
    assert!(f.zfs.dataset_exists("tank/pgbranch/api-main").await.unwrap());
    assert!(f.docker.container_exists("pgbranch-api-main").await.unwrap());
}

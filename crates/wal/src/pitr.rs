//! Point-in-time recovery: target parsing, snapshot selection, and the
//! recovery files PostgreSQL reads on startup
//!
//! Recovery replays archived WAL from the *source* branch's archive on top
//! of the newest snapshot taken before the target, then promotes.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use pgbranch_state::{user_error_with_hint, Branch, Snapshot, State};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const RECOVERY_FILE_MODE: u32 = 0o600;

/// Parse a recovery target: absolute ISO-8601 (`2025-10-07T14:30:00Z`) or
/// relative English (`90 minutes ago`, `2 hours ago`, `1 day ago`).
pub fn parse_recovery_target(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(absolute) = DateTime::parse_from_rfc3339(input) {
        return Ok(absolute.with_timezone(&Utc));
    }

    let words: Vec<&str> = input.split_whitespace().collect();
    if let [amount, unit, "ago"] = words.as_slice() {
        if let Ok(n) = amount.parse::<i64>() {
            let delta = match unit.trim_end_matches('s') {
                "minute" => Some(Duration::minutes(n)),
                "hour" => Some(Duration::hours(n)),
                "day" => Some(Duration::days(n)),
                "week" => Some(Duration::weeks(n)),
                _ => None,
            };
            if let Some(delta) = delta {
                return Ok(now - delta);
            }
        }
    }

    Err(user_error_with_hint(
        format!("unrecognized recovery time '{}'", input),
        "use ISO-8601 (2025-10-07T14:30:00Z) or '<N> <minutes|hours|days|weeks> ago'",
    ))
}

/// Pick the newest snapshot of `branch` created strictly before `target`.
pub fn select_snapshot_before<'a>(
    state: &'a State,
    branch: &Branch,
    target: DateTime<Utc>,
) -> Result<&'a Snapshot> {
    let mut candidates: Vec<&Snapshot> = state
        .snapshots_for_branch(branch.id)
        .into_iter()
        .filter(|s| s.created_at < target)
        .collect();
    candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    candidates.first().copied().ok_or_else(|| {
        user_error_with_hint(
            format!(
                "no snapshot of '{}' exists before {}",
                branch.name,
                target.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            format!(
                "create snapshots with 'pgbranch snapshot create {}' or pick a later target",
                branch.name
            ),
        )
    })
}

/// Write the recovery configuration into a cloned dataset's pgdata:
/// an empty `recovery.signal` and a `postgresql.auto.conf` pointing
/// restore_command at the source archive, both mode 0600.
pub fn write_recovery_files(
    mountpoint: &Path,
    source_archive: &Path,
    target: Option<DateTime<Utc>>,
) -> Result<()> {
    let pgdata = mountpoint.join("pgdata");
    fs::create_dir_all(&pgdata)
        .with_context(|| format!("failed to create {}", pgdata.display()))?;

    let signal = pgdata.join("recovery.signal");
    fs::write(&signal, b"")
        .with_context(|| format!("failed to write {}", signal.display()))?;
    fs::set_permissions(&signal, fs::Permissions::from_mode(RECOVERY_FILE_MODE))?;

    let mut conf = format!(
        "restore_command = 'cp {}/%f %p'\n",
        source_archive.display()
    );
    if let Some(target) = target {
        conf.push_str(&format!(
            "recovery_target_time = '{}'\n",
            target.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    conf.push_str("recovery_target_action = 'promote'\n");

    let conf_path = pgdata.join("postgresql.auto.conf");
    fs::write(&conf_path, conf)
        .with_context(|| format!("failed to write {}", conf_path.display()))?;
    fs::set_permissions(&conf_path, fs::Permissions::from_mode(RECOVERY_FILE_MODE))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pgbranch_state::{BranchStatus, Credentials, Project, UserError};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 7, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_absolute() {
        let t = parse_recovery_target("2025-10-07T14:30:00Z", now()).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2025, 10, 7, 14, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_relative() {
        assert_eq!(
            parse_recovery_target("30 minutes ago", now()).unwrap(),
            now() - Duration::minutes(30)
        );
        assert_eq!(
            parse_recovery_target("1 hour ago", now()).unwrap(),
            now() - Duration::hours(1)
        );
        assert_eq!(
            parse_recovery_target("2 days ago", now()).unwrap(),
            now() - Duration::days(2)
        );
        assert_eq!(
            parse_recovery_target("1 week ago", now()).unwrap(),
            now() - Duration::weeks(1)
        );
    }

    #[test]
    fn test_parse_garbage_is_user_error() {
        for input in ["yesterday", "3 fortnights ago", "soon", "", "x hours ago"] {
            let err = parse_recovery_target(input, now()).unwrap_err();
            assert!(
                err.downcast_ref::<UserError>().is_some(),
                "'{}' should be a user error",
                input
            );
        }
    }

    fn state_with_snapshots(times: &[DateTime<Utc>]) -> (State, Branch) {
        let branch = Branch {
            id: Uuid::new_v4(),
            name: "db/main".into(),
            project_name: "db".into(),
            parent_branch_id: None,
            is_primary: true,
            snapshot_name: None,
            zfs_dataset: "db-main".into(),
            port: 49001,
            created_at: now(),
            size_bytes: 0,
            status: BranchStatus::Running,
        };
        let mut state = State::new("tank", "pgbranch");
        state.projects.push(Project {
            id: Uuid::new_v4(),
            name: "db".into(),
            docker_image: "postgres:17-alpine".into(),
            ssl_cert_dir: "/c".into(),
            created_at: now(),
            credentials: Credentials {
                username: "postgres".into(),
                password: "pw".into(),
                database: "postgres".into(),
            },
            branches: vec![branch.clone()],
        });
        for (i, t) in times.iter().enumerate() {
            state.add_snapshot(Snapshot {
                id: Uuid::new_v4(),
                branch_id: branch.id,
                branch_name: branch.name.clone(),
                project_name: "db".into(),
                zfs_snapshot: format!("tank/pgbranch/db-main@s{}", i),
                created_at: *t,
                label: None,
                size_bytes: 8192,
            });
        }
        (state, branch)
    }

    #[test]
    fn test_select_newest_before_target() {
        let (state, branch) = state_with_snapshots(&[
            now() - Duration::hours(3),
            now() - Duration::hours(2),
            now() - Duration::hours(1),
        ]);
        let picked =
            select_snapshot_before(&state, &branch, now() - Duration::minutes(90)).unwrap();
        assert_eq!(picked.zfs_snapshot, "tank/pgbranch/db-main@s1");
    }

    #[test]
    fn test_select_none_before_target_is_user_error() {
        let (state, branch) = state_with_snapshots(&[now() - Duration::hours(1)]);
        let err =
            select_snapshot_before(&state, &branch, now() - Duration::hours(2)).unwrap_err();
        assert!(err.downcast_ref::<UserError>().is_some());
    }

    #[test]
    fn test_snapshot_exactly_at_target_excluded() {
        let target = now();
        let (state, branch) = state_with_snapshots(&[target]);
        assert!(select_snapshot_before(&state, &branch, target).is_err());
    }

    #[test]
    fn test_recovery_files() {
        let temp = TempDir::new().unwrap();
        let target = Utc.with_ymd_and_hms(2025, 10, 7, 14, 30, 0).unwrap();
        write_recovery_files(temp.path(), Path::new("/cfg/wal-archive/db-main"), Some(target))
            .unwrap();

        let signal = temp.path().join("pgdata/recovery.signal");
        assert!(signal.exists());
        assert_eq!(fs::read(&signal).unwrap().len(), 0);
        assert_eq!(
            fs::metadata(&signal).unwrap().permissions().mode() & 0o7777,
            0o600
        );

        let conf = fs::read_to_string(temp.path().join("pgdata/postgresql.auto.conf")).unwrap();
        assert!(conf.contains("restore_command = 'cp /cfg/wal-archive/db-main/%f %p'"));
        assert!(conf.contains("recovery_target_time = '2025-10-07 14:30:00'"));
        assert!(conf.contains("recovery_target_action = 'promote'"));
    }

    #[test]
    fn test_recovery_files_without_target() {
        let temp = TempDir::new().unwrap();
        write_recovery_files(temp.path(), Path::new("/arch"), None).unwrap();
        let conf = fs::read_to_string(temp.path().join("pgdata/postgresql.auto.conf")).unwrap();
        assert!(!conf.contains("recovery_target_time"));
        assert!(conf.contains("recovery_target_action = 'promote'"));
    }
}

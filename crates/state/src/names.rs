//! Naming rules for projects, branches, datasets, containers and snapshots
//!
//! Every name the system hands to ZFS or Docker is derived here so the
//! mapping stays in one place:
//!
//! - branch namespace:  `<project>/<branch>`
//! - dataset (leaf):    `<project>-<branch>`
//! - dataset (full):    `<pool>/<base>/<project>-<branch>`
//! - container:         `pgbranch-<project>-<branch>`
//! - snapshot:          `<full dataset>@YYYY-MM-DDTHH-MM-SS-mmm[-<label>]`

use crate::error::user_error_with_hint;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;

/// Prefix for every container this tool owns. Also the marker the orphan
/// scan uses to tell our containers from everything else on the host.
pub const CONTAINER_PREFIX: &str = "pgbranch";

/// Name of the branch every project is created with.
pub const MAIN_BRANCH: &str = "main";

/// Validate a bare project or branch name: `[A-Za-z0-9_-]+`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(user_error_with_hint(
            format!("invalid name '{}'", name),
            "names may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// A parsed `<project>/<branch>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    pub project: String,
    pub branch: String,
}

impl BranchRef {
    /// Parse and validate a namespaced branch name.
    pub fn parse(namespaced: &str) -> Result<Self> {
        let mut parts = namespaced.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(project), Some(branch), None) if !project.is_empty() && !branch.is_empty() => {
                validate_name(project)?;
                validate_name(branch)?;
                Ok(Self {
                    project: project.to_string(),
                    branch: branch.to_string(),
                })
            }
            _ => Err(user_error_with_hint(
                format!("invalid branch reference '{}'", namespaced),
                "expected <project>/<branch>, e.g. demo/dev",
            )),
        }
    }

    pub fn new(project: &str, branch: &str) -> Self {
        Self {
            project: project.to_string(),
            branch: branch.to_string(),
        }
    }

    /// The namespaced form stored in state.
    pub fn namespaced(&self) -> String {
        format!("{}/{}", self.project, self.branch)
    }

    /// Leaf dataset name, unique across all projects.
    pub fn dataset(&self) -> String {
        format!("{}-{}", self.project, self.branch)
    }

    /// Container name under the product prefix.
    pub fn container_name(&self) -> String {
        format!("{}-{}-{}", CONTAINER_PREFIX, self.project, self.branch)
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.branch)
    }
}

/// Container name for a project/branch pair held as strings.
pub fn container_name(project: &str, branch: &str) -> String {
    format!("{}-{}-{}", CONTAINER_PREFIX, project, branch)
}

/// Full dataset path under the pool and base prefix.
pub fn full_dataset_path(pool: &str, base: &str, dataset: &str) -> String {
    format!("{}/{}/{}", pool, base, dataset)
}

/// Snapshot stamp: ISO-8601 with punctuation flattened to `-`, millisecond
/// precision, so it is a legal ZFS snapshot component.
pub fn snapshot_stamp(at: DateTime<Utc>, label: Option<&str>) -> String {
    let stamp = at.format("%Y-%m-%dT%H-%M-%S-%3f").to_string();
    match label {
        Some(label) => format!("{}-{}", stamp, label),
        None => stamp,
    }
}

/// Fully-qualified snapshot name for a dataset path and stamp.
pub fn full_snapshot_name(dataset_path: &str, stamp: &str) -> String {
    format!("{}@{}", dataset_path, stamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("my_app-2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("spaced out").is_err());
        assert!(validate_name("pünktlich").is_err());
    }

    #[test]
    fn test_parse_branch_ref() {
        let r = BranchRef::parse("demo/dev").unwrap();
        assert_eq!(r.project, "demo");
        assert_eq!(r.branch, "dev");
        assert_eq!(r.namespaced(), "demo/dev");
        assert_eq!(r.dataset(), "demo-dev");
        assert_eq!(r.container_name(), "pgbranch-demo-dev");

        assert!(BranchRef::parse("demo").is_err());
        assert!(BranchRef::parse("demo/dev/extra").is_err());
        assert!(BranchRef::parse("/dev").is_err());
        assert!(BranchRef::parse("demo/").is_err());
        assert!(BranchRef::parse("de mo/dev").is_err());
    }

    #[test]
    fn test_snapshot_stamp_format() {
        let at = Utc.with_ymd_and_hms(2025, 10, 7, 14, 30, 5).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(snapshot_stamp(at, None), "2025-10-07T14-30-05-042");
        assert_eq!(snapshot_stamp(at, Some("t1")), "2025-10-07T14-30-05-042-t1");
    }

    #[test]
    fn test_full_names() {
        let path = full_dataset_path("tank", "pgbranch", "demo-dev");
        assert_eq!(path, "tank/pgbranch/demo-dev");
        assert_eq!(
            full_snapshot_name(&path, "2025-10-07T14-30-05-042"),
            "tank/pgbranch/demo-dev@2025-10-07T14-30-05-042"
        );
    }
}

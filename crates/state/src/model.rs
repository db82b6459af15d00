//! Persistent data model
//!
//! One JSON document describes everything this tool manages: the pool and
//! base dataset it works under, the projects with their branch forests, and
//! a flat list of snapshots. Field names serialize in camelCase to match the
//! on-disk schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version written into new state documents.
pub const STATE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Running,
    Stopped,
}

impl BranchStatus {
    pub fn is_running(self) -> bool {
        matches!(self, BranchStatus::Running)
    }
}

/// Connection credentials shared by every branch of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub database: String,
}

/// An independent PostgreSQL instance on its own dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: Uuid,
    /// Namespaced `<project>/<branch>` name, globally unique.
    pub name: String,
    pub project_name: String,
    /// `None` only for the primary branch.
    pub parent_branch_id: Option<Uuid>,
    pub is_primary: bool,
    /// Fully-qualified snapshot this branch was cloned from; `None` for the
    /// primary, which was created rather than cloned.
    pub snapshot_name: Option<String>,
    /// Leaf dataset name `<project>-<branch>`.
    pub zfs_dataset: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub status: BranchStatus,
}

impl Branch {
    /// The short branch name (right side of the namespace).
    pub fn short_name(&self) -> &str {
        self.name
            .split_once('/')
            .map(|(_, branch)| branch)
            .unwrap_or(self.name.as_str())
    }
}

/// A PostgreSQL instance group: shared image, credentials and certs, plus
/// the branch forest rooted at the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub docker_image: String,
    pub ssl_cert_dir: String,
    pub created_at: DateTime<Utc>,
    pub credentials: Credentials,
    pub branches: Vec<Branch>,
}

impl Project {
    pub fn primary(&self) -> Option<&Branch> {
        self.branches.iter().find(|b| b.is_primary)
    }

    pub fn branch_by_id(&self, id: Uuid) -> Option<&Branch> {
        self.branches.iter().find(|b| b.id == id)
    }

    /// Direct children of the given branch.
    pub fn children_of(&self, id: Uuid) -> Vec<&Branch> {
        self.branches
            .iter()
            .filter(|b| b.parent_branch_id == Some(id))
            .collect()
    }

    /// Subtree rooted at `id` in post-order: children first, the root last.
    /// This is both the deletion order and the tree display order.
    pub fn subtree_post_order(&self, id: Uuid) -> Vec<&Branch> {
        let mut out = Vec::new();
        self.collect_post_order(id, &mut out);
        out
    }

    fn collect_post_order<'a>(&'a self, id: Uuid, out: &mut Vec<&'a Branch>) {
        for child in self.children_of(id) {
            self.collect_post_order(child.id, out);
        }
        if let Some(branch) = self.branch_by_id(id) {
            out.push(branch);
        }
    }
}

/// A durable capture of a branch at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub branch_name: String,
    pub project_name: String,
    /// Fully-qualified `<pool>/<base>/<ds>@<stamp>` name.
    pub zfs_snapshot: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub size_bytes: u64,
}

/// The whole persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub version: String,
    pub initialized_at: DateTime<Utc>,
    pub zfs_pool: String,
    pub zfs_dataset_base: String,
    pub projects: Vec<Project>,
    pub snapshots: Vec<Snapshot>,
}

impl State {
    pub fn new(pool: &str, base: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            initialized_at: Utc::now(),
            zfs_pool: pool.to_string(),
            zfs_dataset_base: base.to_string(),
            projects: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }

    pub fn project_mut(&mut self, name: &str) -> Option<&mut Project> {
        self.projects.iter_mut().find(|p| p.name == name)
    }

    /// Look up a branch by its namespaced `<project>/<branch>` name.
    pub fn branch(&self, namespaced: &str) -> Option<&Branch> {
        self.projects
            .iter()
            .flat_map(|p| p.branches.iter())
            .find(|b| b.name == namespaced)
    }

    pub fn branch_mut(&mut self, namespaced: &str) -> Option<&mut Branch> {
        self.projects
            .iter_mut()
            .flat_map(|p| p.branches.iter_mut())
            .find(|b| b.name == namespaced)
    }

    pub fn all_branches(&self) -> impl Iterator<Item = &Branch> {
        self.projects.iter().flat_map(|p| p.branches.iter())
    }

    pub fn snapshot_by_id(&self, id: Uuid) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    pub fn snapshots_for_branch(&self, branch_id: Uuid) -> Vec<&Snapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.branch_id == branch_id)
            .collect()
    }

    pub fn snapshots_for_project(&self, project_name: &str) -> Vec<&Snapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.project_name == project_name)
            .collect()
    }

    pub fn remove_snapshot(&mut self, id: Uuid) -> Option<Snapshot> {
        let idx = self.snapshots.iter().position(|s| s.id == id)?;
        Some(self.snapshots.remove(idx))
    }

    /// Drop every snapshot record belonging to a branch; returns how many.
    pub fn remove_snapshots_for_branch(&mut self, branch_id: Uuid) -> usize {
        let before = self.snapshots.len();
        self.snapshots.retain(|s| s.branch_id != branch_id);
        before - self.snapshots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(name: &str, project: &str, parent: Option<Uuid>, primary: bool) -> Branch {
        Branch {
            id: Uuid::new_v4(),
            name: format!("{}/{}", project, name),
            project_name: project.to_string(),
            parent_branch_id: parent,
            is_primary: primary,
            snapshot_name: None,
            zfs_dataset: format!("{}-{}", project, name),
            port: 5432,
            created_at: Utc::now(),
            size_bytes: 0,
            status: BranchStatus::Running,
        }
    }

    #[test]
    fn test_post_order_children_before_parent() {
        let main = branch("main", "api", None, true);
        let dev = branch("dev", "api", Some(main.id), false);
        let feature = branch("feature", "api", Some(dev.id), false);

        let project = Project {
            id: Uuid::new_v4(),
            name: "api".to_string(),
            docker_image: "postgres:17-alpine".to_string(),
            ssl_cert_dir: "/tmp/certs/api".to_string(),
            created_at: Utc::now(),
            credentials: Credentials {
                username: "postgres".to_string(),
                password: "secret".to_string(),
                database: "postgres".to_string(),
            },
            branches: vec![main.clone(), dev.clone(), feature.clone()],
        };

        let order: Vec<_> = project
            .subtree_post_order(dev.id)
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(order, vec!["api/feature", "api/dev"]);

        let whole: Vec<_> = project
            .subtree_post_order(main.id)
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(whole, vec!["api/feature", "api/dev", "api/main"]);
    }

    #[test]
    fn test_short_name() {
        let b = branch("dev", "demo", None, false);
        assert_eq!(b.short_name(), "dev");
    }

    #[test]
    fn test_state_json_field_names() {
        let state = State::new("tank", "pgbranch");
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"zfsPool\""));
        assert!(json.contains("\"zfsDatasetBase\""));
        assert!(json.contains("\"initializedAt\""));
    }
}

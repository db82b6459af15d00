//! Durable state store
//!
//! The whole document lives in one JSON file with three siblings: `.tmp`
//! (staging for the atomic rename), `.backup` (single previous version) and
//! `.lock` (advisory inter-process lock). Readers that do not save need no
//! lock; concurrent readers see either the old complete document or the new
//! one, never a torn write.

use crate::error::user_error_with_hint;
use crate::lock::StateLock;
use crate::model::{Snapshot, State};
use crate::validate;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, "backup")
    }

    fn tmp_path(&self) -> PathBuf {
        sibling(&self.path, "tmp")
    }

    fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    /// Load the state document. A missing file is not an error: the store
    /// is simply uninitialized until the first save.
    pub fn load(&self) -> Result<Option<State>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };

        let state: State = serde_json::from_str(&content).with_context(|| {
            format!(
                "state file {} is corrupt; run 'pgbranch state restore' to recover the backup",
                self.path.display()
            )
        })?;

        validate::validate(&state).with_context(|| {
            format!(
                "state file {} violates invariants; run 'pgbranch state restore'",
                self.path.display()
            )
        })?;

        Ok(Some(state))
    }

    /// Load, failing with a user error when the store is uninitialized.
    pub fn load_required(&self) -> Result<State> {
        self.load()?.ok_or_else(|| {
            user_error_with_hint(
                "no state found - nothing has been created yet",
                "run 'pgbranch project create <name>' first",
            )
        })
    }

    /// Persist the document with the atomic save protocol: lock, write and
    /// fsync a temp sibling, back up the current file, rename over it,
    /// fsync the directory, release the lock.
    pub fn save(&self, state: &State) -> Result<()> {
        let _lock = StateLock::acquire(&self.lock_path())?;
        self.write_locked(state)
    }

    /// Read-modify-write under the lock. The closure sees the freshest
    /// document (or `None` when uninitialized) so precondition checks such
    /// as duplicate names hold against concurrent writers, not a stale
    /// read. The closure must leave `Some` state behind.
    pub fn update<F>(&self, f: F) -> Result<State>
    where
        F: FnOnce(&mut Option<State>) -> Result<()>,
    {
        let _lock = StateLock::acquire(&self.lock_path())?;
        let mut state = self.load()?;
        f(&mut state)?;
        let state = state.context("state update produced no document")?;
        self.write_locked(&state)?;
        Ok(state)
    }

    fn write_locked(&self, state: &State) -> Result<()> {
        let json =
            serde_json::to_string_pretty(state).context("failed to serialize state")?;

        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
                .with_context(|| format!("failed to fsync {}", tmp.display()))?;
        }

        if self.path.exists() {
            fs::copy(&self.path, self.backup_path())
                .context("failed to write state backup")?;
        }

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;

        if let Some(dir) = self.path.parent() {
            File::open(dir)
                .and_then(|d| d.sync_all())
                .with_context(|| format!("failed to fsync {}", dir.display()))?;
        }

        Ok(())
    }

    /// Replace the primary file with the `.backup` sibling.
    pub fn restore_backup(&self) -> Result<State> {
        let backup = self.backup_path();
        if !backup.exists() {
            return Err(user_error_with_hint(
                "no state backup found",
                format!("expected a backup at {}", backup.display()),
            ));
        }

        fs::copy(&backup, &self.path).context("failed to restore state from backup")?;
        self.load()?
            .context("backup restored but state file still missing")
    }
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

// ----------------------------------------------------------------------------
// Typed mutation helpers
// ----------------------------------------------------------------------------

impl State {
    /// Add a project, rejecting duplicates.
    pub fn add_project(&mut self, project: crate::model::Project) -> Result<()> {
        if self.project(&project.name).is_some() {
            return Err(user_error_with_hint(
                format!("project '{}' already exists", project.name),
                "pick another name or delete the existing project",
            ));
        }
        self.projects.push(project);
        Ok(())
    }

    pub fn remove_project(&mut self, name: &str) -> Result<crate::model::Project> {
        let idx = self
            .projects
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| {
                user_error_with_hint(
                    format!("project '{}' not found", name),
                    "run 'pgbranch project list'",
                )
            })?;
        Ok(self.projects.remove(idx))
    }

    /// Add a branch under its project, rejecting duplicate names.
    pub fn add_branch(&mut self, branch: crate::model::Branch) -> Result<()> {
        if self.branch(&branch.name).is_some() {
            return Err(user_error_with_hint(
                format!("branch '{}' already exists", branch.name),
                "pick another branch name",
            ));
        }
        let project = self
            .project_mut(&branch.project_name)
            .ok_or_else(|| anyhow::anyhow!("project '{}' not in state", branch.project_name))?;
        project.branches.push(branch);
        Ok(())
    }

    pub fn remove_branch(&mut self, namespaced: &str) -> Result<crate::model::Branch> {
        for project in &mut self.projects {
            if let Some(idx) = project.branches.iter().position(|b| b.name == namespaced) {
                return Ok(project.branches.remove(idx));
            }
        }
        Err(user_error_with_hint(
            format!("branch '{}' not found", namespaced),
            "run 'pgbranch branch list'",
        ))
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshots.push(snapshot);
    }

    /// Snapshots of a branch older than the cutoff.
    pub fn snapshots_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
        branch_id: Option<Uuid>,
    ) -> Vec<&Snapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.created_at < cutoff)
            .filter(|s| branch_id.map_or(true, |id| s.branch_id == id))
            .collect()
    }
}

//! Compensating actions for partially-completed operations
//!
//! Commands register an action as each external resource is acquired and
//! clear the registry once state is committed. On failure the registry
//! unwinds in reverse insertion order; an action that itself fails is
//! logged and skipped so unwinding always runs to completion, and the
//! original error is what the user sees.

use pgbranch_docker::ContainerDriver;
use pgbranch_zfs::ZfsDriver;

#[derive(Debug, Clone)]
pub enum RollbackAction {
    /// Destroy a snapshot created by this operation.
    DestroySnapshot { full_name: String },
    /// Destroy a dataset (recursively) created by this operation.
    DestroyDataset { name: String },
    /// Force-remove a container created by this operation.
    RemoveContainer { id: String },
}

#[derive(Default)]
pub struct RollbackRegistry {
    actions: Vec<RollbackAction>,
}

impl RollbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, action: RollbackAction) {
        self.actions.push(action);
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every registered action, newest first.
    pub async fn unwind(&mut self, zfs: &dyn ZfsDriver, docker: &dyn ContainerDriver) {
        while let Some(action) = self.actions.pop() {
            tracing::info!("rolling back: {:?}", action);
            let result = match &action {
                RollbackAction::DestroySnapshot { full_name } => {
                    zfs.destroy_snapshot(full_name).await
                }
                RollbackAction::DestroyDataset { name } => zfs.destroy_dataset(name, true).await,
                RollbackAction::RemoveContainer { id } => docker.remove_container(id, true).await,
            };
            if let Err(e) = result {
                tracing::warn!("rollback action {:?} failed: {:#}", action, e);
            }
        }
    }
}

//! Orphan reconciliation
//!
//! Compares persisted state against what actually exists: datasets under
//! the base that no branch claims, and containers carrying our prefix that
//! no branch expects. Both come from interrupted operations or manual
//! tinkering; `cleanup` reclaims them.

use crate::ctx::Ctx;
use anyhow::Result;
use pgbranch_docker::ContainerInfo;
use pgbranch_state::{container_name, State, CONTAINER_PREFIX};
use pgbranch_zfs::DatasetInfo;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct OrphanReport {
    pub datasets: Vec<DatasetInfo>,
    pub containers: Vec<ContainerInfo>,
    pub total_wasted_bytes: u64,
}

impl OrphanReport {
    pub fn total_orphans(&self) -> usize {
        self.datasets.len() + self.containers.len()
    }

    pub fn is_clean(&self) -> bool {
        self.total_orphans() == 0
    }
}

/// Detect datasets and containers not reflected in state.
pub async fn detect(ctx: &Ctx, state: &State) -> Result<OrphanReport> {
    let expected_datasets: HashSet<String> = state
        .all_branches()
        .map(|b| b.zfs_dataset.clone())
        .collect();
    let expected_containers: HashSet<String> = state
        .all_branches()
        .map(|b| {
            let (project, branch) = b.name.split_once('/').unwrap_or((b.project_name.as_str(), ""));
            container_name(project, branch)
        })
        .collect();

    let mut report = OrphanReport::default();

    // The base dataset itself never counts; listing already excludes it.
    for dataset in ctx.zfs.list_datasets(&ctx.base_path(state)).await? {
        if !expected_datasets.contains(dataset.leaf_name()) {
            report.total_wasted_bytes += dataset.used_bytes;
            report.datasets.push(dataset);
        }
    }

    let prefix = format!("{}-", CONTAINER_PREFIX);
    for container in ctx.docker.list_containers().await? {
        if container.name.starts_with(&prefix) && !expected_containers.contains(&container.name) {
            report.containers.push(container);
        }
    }

    Ok(report)
}

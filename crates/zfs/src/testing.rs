//! In-memory driver for tests
//!
//! Models just enough ZFS semantics for controller tests: dataset and
//! snapshot namespaces, clone origins with recursive destroy, rename of
//! unmounted datasets, and real directories backing mountpoints so code
//! that writes into a mountpoint works unchanged. Individual operations can
//! be armed to fail once for rollback testing.

use crate::{DatasetInfo, DatasetOptions, PoolStatus, ZfsDriver};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

/// Space a fresh clone reports before any writes divert.
pub const CLONE_INITIAL_BYTES: u64 = 130_048;

#[derive(Debug, Clone)]
struct MemDataset {
    used_bytes: u64,
    mounted: bool,
    origin: Option<String>,
    created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct MemSnapshot {
    dataset: String,
    size_bytes: u64,
}

#[derive(Default)]
struct Inner {
    pools: Vec<String>,
    datasets: BTreeMap<String, MemDataset>,
    snapshots: BTreeMap<String, MemSnapshot>,
    fail_once: HashSet<String>,
}

pub struct MemZfs {
    /// Directory under which fake mountpoints are materialized.
    root: PathBuf,
    inner: Mutex<Inner>,
}

impl MemZfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let inner = Inner {
            pools: vec!["tank".to_string()],
            ..Default::default()
        };
        Self {
            root: root.into(),
            inner: Mutex::new(inner),
        }
    }

    pub fn with_pools(root: impl Into<PathBuf>, pools: &[&str]) -> Self {
        let zfs = Self::new(root);
        zfs.inner.lock().unwrap().pools = pools.iter().map(|p| p.to_string()).collect();
        zfs
    }

    /// Arm `op` (trait method name) to fail on its next invocation.
    pub fn fail_once(&self, op: &str) {
        self.inner.lock().unwrap().fail_once.insert(op.to_string());
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().datasets.keys().cloned().collect()
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().snapshots.keys().cloned().collect()
    }

    pub fn is_mounted(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .datasets
            .get(name)
            .map(|d| d.mounted)
            .unwrap_or(false)
    }

    /// Overwrite a dataset's reported space, simulating divergence.
    pub fn set_used_bytes(&self, name: &str, bytes: u64) {
        if let Some(ds) = self.inner.lock().unwrap().datasets.get_mut(name) {
            ds.used_bytes = bytes;
        }
    }

    /// Plant a dataset directly, bypassing create options (orphan tests).
    pub fn plant_dataset(&self, name: &str, used_bytes: u64) {
        self.inner.lock().unwrap().datasets.insert(
            name.to_string(),
            MemDataset {
                used_bytes,
                mounted: false,
                origin: None,
                created: Utc::now(),
            },
        );
    }

    fn mountpoint_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Synchronous mountpoint accessor for test assertions.
    pub fn mountpoint_of(&self, name: &str) -> String {
        self.mountpoint_path(name).display().to_string()
    }

    fn check_fail(&self, op: &str) -> Result<()> {
        if self.inner.lock().unwrap().fail_once.remove(op) {
            bail!("injected failure in {}", op);
        }
        Ok(())
    }

    fn info(&self, name: &str, ds: &MemDataset) -> DatasetInfo {
        DatasetInfo {
            name: name.to_string(),
            used_bytes: ds.used_bytes,
            avail_bytes: 100 << 30,
            refer_bytes: ds.used_bytes,
            mountpoint: ds
                .mounted
                .then(|| self.mountpoint_path(name).display().to_string()),
            created: Some(ds.created),
        }
    }
}

#[async_trait]
impl ZfsDriver for MemZfs {
    async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().pools.clone())
    }

    async fn pool_exists(&self, pool: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().pools.iter().any(|p| p == pool))
    }

    async fn pool_status(&self, pool: &str) -> Result<PoolStatus> {
        if !self.pool_exists(pool).await? {
            bail!("cannot open '{}': no such pool", pool);
        }
        Ok(PoolStatus {
            health: "ONLINE".to_string(),
            size_bytes: 500 << 30,
            allocated_bytes: 50 << 30,
            free_bytes: 450 << 30,
        })
    }

    async fn create_dataset(&self, name: &str, _options: &DatasetOptions) -> Result<()> {
        self.check_fail("create_dataset")?;
        let mut inner = self.inner.lock().unwrap();
        if inner.datasets.contains_key(name) {
            bail!("cannot create '{}': dataset already exists", name);
        }
        inner.datasets.insert(
            name.to_string(),
            MemDataset {
                used_bytes: 24_576,
                mounted: false,
                origin: None,
                created: Utc::now(),
            },
        );
        Ok(())
    }

    async fn destroy_dataset(&self, name: &str, recursive: bool) -> Result<()> {
        self.check_fail("destroy_dataset")?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.datasets.contains_key(name) {
            bail!("cannot destroy '{}': dataset does not exist", name);
        }

        // Walk clone dependencies: snapshots of this dataset and datasets
        // cloned from them, transitively.
        let mut doomed_datasets = vec![name.to_string()];
        let mut doomed_snapshots = Vec::new();
        let mut cursor = 0;
        while cursor < doomed_datasets.len() {
            let ds = doomed_datasets[cursor].clone();
            cursor += 1;
            let snaps: Vec<String> = inner
                .snapshots
                .iter()
                .filter(|(_, s)| s.dataset == ds)
                .map(|(n, _)| n.clone())
                .collect();
            for snap in snaps {
                let clones: Vec<String> = inner
                    .datasets
                    .iter()
                    .filter(|(_, d)| d.origin.as_deref() == Some(snap.as_str()))
                    .map(|(n, _)| n.clone())
                    .collect();
                if !recursive && !clones.is_empty() {
                    bail!(
                        "cannot destroy '{}': snapshot {} has dependent clones",
                        name,
                        snap
                    );
                }
                doomed_snapshots.push(snap);
                doomed_datasets.extend(clones);
            }
        }

        for snap in &doomed_snapshots {
            inner.snapshots.remove(snap);
        }
        for ds in &doomed_datasets {
            inner.datasets.remove(ds);
        }
        Ok(())
    }

    async fn dataset_exists(&self, name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().datasets.contains_key(name))
    }

    async fn get_dataset(&self, name: &str) -> Result<DatasetInfo> {
        let inner = self.inner.lock().unwrap();
        let ds = inner
            .datasets
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("dataset '{}' does not exist", name))?;
        Ok(self.info(name, ds))
    }

    async fn list_datasets(&self, base: &str) -> Result<Vec<DatasetInfo>> {
        let prefix = format!("{}/", base);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .datasets
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, ds)| self.info(name, ds))
            .collect())
    }

    async fn set_property(&self, _dataset: &str, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    async fn get_property(&self, dataset: &str, key: &str) -> Result<String> {
        if key == "mountpoint" {
            return Ok(self.mountpoint_path(dataset).display().to_string());
        }
        Ok("-".to_string())
    }

    async fn mount_dataset(&self, name: &str) -> Result<()> {
        self.check_fail("mount_dataset")?;
        let path = self.mountpoint_path(name);
        let mut inner = self.inner.lock().unwrap();
        let ds = inner
            .datasets
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("cannot mount '{}': dataset does not exist", name))?;
        // Idempotent: mounting a mounted dataset is success.
        ds.mounted = true;
        std::fs::create_dir_all(&path)?;
        Ok(())
    }

    async fn unmount_dataset(&self, name: &str) -> Result<()> {
        self.check_fail("unmount_dataset")?;
        let mut inner = self.inner.lock().unwrap();
        let ds = inner
            .datasets
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("cannot unmount '{}': dataset does not exist", name))?;
        ds.mounted = false;
        Ok(())
    }

    async fn rename_dataset(&self, from: &str, to: &str) -> Result<()> {
        self.check_fail("rename_dataset")?;
        let mut inner = self.inner.lock().unwrap();
        let ds = inner
            .datasets
            .get(from)
            .ok_or_else(|| anyhow::anyhow!("cannot rename '{}': dataset does not exist", from))?
            .clone();
        if ds.mounted {
            bail!("cannot rename '{}': unmount the dataset first", from);
        }
        if inner.datasets.contains_key(to) {
            bail!("cannot rename to '{}': dataset already exists", to);
        }
        inner.datasets.remove(from);
        inner.datasets.insert(to.to_string(), ds);

        // Snapshots move with the dataset; clone origins follow.
        let from_at = format!("{}@", from);
        let renames: Vec<(String, String)> = inner
            .snapshots
            .keys()
            .filter(|n| n.starts_with(&from_at))
            .map(|n| (n.clone(), n.replacen(from, to, 1)))
            .collect();
        for (old, new) in renames {
            if let Some(mut snap) = inner.snapshots.remove(&old) {
                snap.dataset = to.to_string();
                inner.snapshots.insert(new.clone(), snap);
            }
            for dataset in inner.datasets.values_mut() {
                if dataset.origin.as_deref() == Some(old.as_str()) {
                    dataset.origin = Some(new.clone());
                }
            }
        }

        // Preserve mountpoint contents across the rename, as zfs does.
        let old_path = self.mountpoint_path(from);
        if old_path.exists() {
            let new_path = self.mountpoint_path(to);
            if let Some(parent) = new_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&old_path, &new_path)?;
        }
        Ok(())
    }

    async fn mountpoint(&self, name: &str) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        if !inner.datasets.contains_key(name) {
            bail!("dataset '{}' does not exist", name);
        }
        Ok(self.mountpoint_path(name).display().to_string())
    }

    async fn used_space(&self, name: &str) -> Result<u64> {
        Ok(self.get_dataset(name).await?.used_bytes)
    }

    async fn create_snapshot(&self, dataset: &str, stamp: &str) -> Result<String> {
        self.check_fail("create_snapshot")?;
        let full = format!("{}@{}", dataset, stamp);
        let mut inner = self.inner.lock().unwrap();
        if !inner.datasets.contains_key(dataset) {
            bail!("cannot snapshot '{}': dataset does not exist", dataset);
        }
        if inner.snapshots.contains_key(&full) {
            bail!("cannot create snapshot '{}': already exists", full);
        }
        inner.snapshots.insert(
            full.clone(),
            MemSnapshot {
                dataset: dataset.to_string(),
                size_bytes: 8_192,
            },
        );
        Ok(full)
    }

    async fn destroy_snapshot(&self, full_name: &str) -> Result<()> {
        self.check_fail("destroy_snapshot")?;
        let mut inner = self.inner.lock().unwrap();
        let has_clone = inner
            .datasets
            .values()
            .any(|d| d.origin.as_deref() == Some(full_name));
        if has_clone {
            bail!("cannot destroy '{}': snapshot has dependent clones", full_name);
        }
        if inner.snapshots.remove(full_name).is_none() {
            bail!("cannot destroy '{}': snapshot does not exist", full_name);
        }
        Ok(())
    }

    async fn snapshot_exists(&self, full_name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().snapshots.contains_key(full_name))
    }

    async fn list_snapshots(&self, dataset: Option<&str>) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .snapshots
            .iter()
            .filter(|(_, s)| dataset.map_or(true, |d| s.dataset == d))
            .map(|(n, _)| n.clone())
            .collect())
    }

    async fn snapshot_size(&self, full_name: &str) -> Result<u64> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .get(full_name)
            .map(|s| s.size_bytes)
            .ok_or_else(|| anyhow::anyhow!("snapshot '{}' does not exist", full_name))
    }

    async fn clone_snapshot(&self, full_snapshot: &str, target_dataset: &str) -> Result<()> {
        self.check_fail("clone_snapshot")?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.snapshots.contains_key(full_snapshot) {
            bail!("cannot clone '{}': snapshot does not exist", full_snapshot);
        }
        if inner.datasets.contains_key(target_dataset) {
            bail!("cannot clone to '{}': dataset already exists", target_dataset);
        }
        inner.datasets.insert(
            target_dataset.to_string(),
            MemDataset {
                used_bytes: CLONE_INITIAL_BYTES,
                mounted: false,
                origin: Some(full_snapshot.to_string()),
                created: Utc::now(),
            },
        );
        Ok(())
    }

    async fn promote_clone(&self, dataset: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ds = inner
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| anyhow::anyhow!("cannot promote '{}': dataset does not exist", dataset))?;
        ds.origin = None;
        Ok(())
    }
}

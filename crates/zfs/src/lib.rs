//! ZFS driver: datasets, snapshots and clones behind a swappable trait
//!
//! The `Zfs` implementation shells out to `zfs`/`zpool`. Controller code
//! only sees `ZfsDriver`, so tests run against the in-memory fake in
//! [`testing`].

mod driver;
mod exec;
pub mod testing;

pub use driver::Zfs;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Health and capacity of a pool.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub health: String,
    pub size_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
}

/// Properties of a single dataset.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    /// Full dataset path, e.g. `tank/pgbranch/demo-main`.
    pub name: String,
    pub used_bytes: u64,
    pub avail_bytes: u64,
    pub refer_bytes: u64,
    /// `None` when the dataset is not mounted.
    pub mountpoint: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

impl DatasetInfo {
    /// The last path component, e.g. `demo-main`.
    pub fn leaf_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Options applied when creating a dataset.
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub compression: String,
    /// PostgreSQL writes 8 KiB pages, so the default recordsize matches.
    pub recordsize: String,
    pub atime_off: bool,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            compression: "lz4".to_string(),
            recordsize: "8K".to_string(),
            atime_off: true,
        }
    }
}

/// Contract over the copy-on-write filesystem.
///
/// All dataset arguments are full paths (`<pool>/<base>/<leaf>`); snapshot
/// arguments are fully qualified (`<dataset>@<stamp>`). Mount and unmount
/// are idempotent: already-mounted and not-mounted conditions are success.
#[async_trait]
pub trait ZfsDriver: Send + Sync {
    async fn list_pools(&self) -> Result<Vec<String>>;
    async fn pool_exists(&self, pool: &str) -> Result<bool>;
    async fn pool_status(&self, pool: &str) -> Result<PoolStatus>;

    /// Create a dataset, auto-creating parents. The "may only be mounted by
    /// root" condition is success.
    async fn create_dataset(&self, name: &str, options: &DatasetOptions) -> Result<()>;
    /// Destroy a dataset; `recursive` also destroys children and clones.
    async fn destroy_dataset(&self, name: &str, recursive: bool) -> Result<()>;
    async fn dataset_exists(&self, name: &str) -> Result<bool>;
    async fn get_dataset(&self, name: &str) -> Result<DatasetInfo>;
    /// Datasets of type filesystem under `base`, recursively, excluding
    /// `base` itself.
    async fn list_datasets(&self, base: &str) -> Result<Vec<DatasetInfo>>;
    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()>;
    async fn get_property(&self, dataset: &str, key: &str) -> Result<String>;
    async fn mount_dataset(&self, name: &str) -> Result<()>;
    async fn unmount_dataset(&self, name: &str) -> Result<()>;
    /// Rename a dataset; it must be unmounted first.
    async fn rename_dataset(&self, from: &str, to: &str) -> Result<()>;
    async fn mountpoint(&self, name: &str) -> Result<String>;
    async fn used_space(&self, name: &str) -> Result<u64>;

    /// Create `<dataset>@<stamp>` and return the full snapshot name.
    async fn create_snapshot(&self, dataset: &str, stamp: &str) -> Result<String>;
    async fn destroy_snapshot(&self, full_name: &str) -> Result<()>;
    async fn snapshot_exists(&self, full_name: &str) -> Result<bool>;
    /// Snapshots under `dataset`, or all snapshots when `None`.
    async fn list_snapshots(&self, dataset: Option<&str>) -> Result<Vec<String>>;
    async fn snapshot_size(&self, full_name: &str) -> Result<u64>;

    async fn clone_snapshot(&self, full_snapshot: &str, target_dataset: &str) -> Result<()>;
    async fn promote_clone(&self, dataset: &str) -> Result<()>;
}

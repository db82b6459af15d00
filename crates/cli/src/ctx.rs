//! Command context
//!
//! Bundles the config, the state store, and the external drivers behind
//! their traits so integration tests can wire in-memory fakes through the
//! same command code paths the binary uses.

use crate::config::{self, SystemConfig};
use crate::ssl::{CertProvider, OpensslCerts};
use anyhow::{Context, Result};
use pgbranch_docker::{ContainerDriver, Docker};
use pgbranch_state::{full_dataset_path, State, StateStore};
use pgbranch_wal::WalArchive;
use pgbranch_zfs::{DatasetOptions, Zfs, ZfsDriver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct Ctx {
    pub config: SystemConfig,
    pub root: PathBuf,
    pub store: StateStore,
    pub wal: WalArchive,
    pub zfs: Arc<dyn ZfsDriver>,
    pub docker: Arc<dyn ContainerDriver>,
    pub certs: Arc<dyn CertProvider>,
}

impl Ctx {
    /// Production wiring: real drivers under the user's config root.
    pub fn load() -> Result<Self> {
        let root = config::config_root()?;
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        let config = config::load()?;

        Ok(Self::with_parts(
            root,
            config,
            Arc::new(Zfs::new()),
            Arc::new(Docker::new()),
            Arc::new(OpensslCerts),
        ))
    }

    /// Explicit wiring, used by tests to inject fakes.
    pub fn with_parts(
        root: PathBuf,
        config: SystemConfig,
        zfs: Arc<dyn ZfsDriver>,
        docker: Arc<dyn ContainerDriver>,
        certs: Arc<dyn CertProvider>,
    ) -> Self {
        let store = StateStore::new(root.join("state.json"));
        let wal = WalArchive::new(root.join("wal-archive"));
        Self {
            config,
            root,
            store,
            wal,
            zfs,
            docker,
            certs,
        }
    }

    /// Full dataset path for a leaf name under the state's pool and base.
    pub fn dataset_path(&self, state: &State, dataset: &str) -> String {
        full_dataset_path(&state.zfs_pool, &state.zfs_dataset_base, dataset)
    }

    /// The base dataset every branch dataset lives under.
    pub fn base_path(&self, state: &State) -> String {
        format!("{}/{}", state.zfs_pool, state.zfs_dataset_base)
    }

    pub fn cert_dir(&self, project: &str) -> PathBuf {
        self.root.join("certs").join(project)
    }

    pub fn dataset_options(&self) -> DatasetOptions {
        DatasetOptions {
            compression: self.config.zfs.compression.clone(),
            recordsize: self.config.zfs.recordsize.clone(),
            atime_off: self.config.zfs.atime_off,
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.config.docker.ready_timeout_secs)
    }

    pub fn stop_timeout(&self) -> u32 {
        self.config.docker.stop_timeout_secs
    }

    /// Marker written by `pgbranch setup` once host permissions are in
    /// place; its absence means setup has not run.
    pub fn setup_marker(&self) -> PathBuf {
        self.root.join(".setup-complete")
    }

    pub fn setup_has_run(&self) -> bool {
        self.setup_marker().exists()
    }

    pub fn mark_setup_complete(&self) -> Result<()> {
        let marker = self.setup_marker();
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&marker, b"")
            .with_context(|| format!("failed to write {}", marker.display()))
    }
}

/// Delete a directory tree, treating a missing path as done.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

//! Container driver: PostgreSQL containers behind a swappable trait
//!
//! The `Docker` implementation drives a Docker-compatible daemon through
//! the `docker` CLI. Controller code only sees `ContainerDriver`; tests use
//! the in-memory fake in [`testing`].

mod config;
mod driver;
pub mod testing;

pub use config::ContainerConfig;
pub use driver::Docker;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Default budget for a container to become ready. PITR replay happens
/// inside this window too.
pub const READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Poll interval while waiting for readiness.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period passed to `docker stop`.
pub const DEFAULT_STOP_TIMEOUT_SECS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Exited,
    Other(String),
}

impl ContainerStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "exited" | "dead" => Self::Exited,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
}

/// Contract over the container runtime.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create a container and return its id. Does not start it.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<()>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;
    async fn restart_container(&self, id: &str) -> Result<()>;
    async fn container_status(&self, id: &str) -> Result<ContainerStatus>;
    async fn container_exists(&self, name: &str) -> Result<bool>;
    async fn container_by_name(&self, name: &str) -> Result<Option<ContainerInfo>>;
    /// Host port bound to the container's 5432.
    async fn container_port(&self, id: &str) -> Result<u16>;
    /// Every container, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
    /// Poll until PostgreSQL accepts connections: inspect, then
    /// `pg_isready` once the container is running. Exceeding `timeout` is a
    /// system error.
    async fn wait_for_healthy(&self, id: &str, user: &str, timeout: Duration) -> Result<()>;
    /// Run SQL non-interactively and return trimmed stdout. Non-zero exit
    /// or non-empty stderr is an error carrying the stderr text.
    async fn exec_sql(&self, id: &str, sql: &str, user: &str, db: &str) -> Result<String>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    async fn image_exists(&self, image: &str) -> Result<bool>;
    async fn start_backup_mode(&self, id: &str, user: &str, db: &str) -> Result<()>;
    async fn stop_backup_mode(&self, id: &str, user: &str, db: &str) -> Result<()>;
}

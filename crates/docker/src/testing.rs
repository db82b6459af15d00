//! In-memory container runtime for tests
//!
//! Tracks container lifecycle, hands out host ports the way the runtime
//! would, and records every SQL statement so tests can assert ordering
//! (CHECKPOINT before snapshot, for instance). Operations can be armed to
//! fail once for rollback testing.

use crate::{ContainerConfig, ContainerDriver, ContainerInfo, ContainerStatus};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct MemContainer {
    name: String,
    image: String,
    host_port: u16,
    data_dir: String,
    wal_archive_dir: String,
    status: ContainerStatus,
}

#[derive(Default)]
struct Inner {
    containers: BTreeMap<String, MemContainer>,
    images: HashSet<String>,
    sql_log: Vec<(String, String)>,
    fail_once: HashSet<String>,
    next_id: u64,
    next_port: u16,
}

pub struct MemDocker {
    inner: Mutex<Inner>,
}

impl MemDocker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_port: 49153,
                ..Default::default()
            }),
        }
    }

    pub fn fail_once(&self, op: &str) {
        self.inner.lock().unwrap().fail_once.insert(op.to_string());
    }

    pub fn container_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    /// (container name, sql) pairs in execution order.
    pub fn sql_log(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().sql_log.clone()
    }

    /// Plant a container directly (orphan tests).
    pub fn plant_container(&self, name: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("mem{:08x}", inner.next_id);
        inner.containers.insert(
            id.clone(),
            MemContainer {
                name: name.to_string(),
                image: "postgres:17-alpine".to_string(),
                host_port: 1,
                data_dir: String::new(),
                wal_archive_dir: String::new(),
                status: ContainerStatus::Running,
            },
        );
        id
    }

    /// Host path the named container mounts as its WAL archive.
    pub fn wal_archive_dir_of(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|c| c.name == name)
            .map(|c| c.wal_archive_dir.clone())
    }

    fn check_fail(&self, op: &str) -> Result<()> {
        if self.inner.lock().unwrap().fail_once.remove(op) {
            bail!("injected failure in {}", op);
        }
        Ok(())
    }
}

impl Default for MemDocker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerDriver for MemDocker {
    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        self.check_fail("create_container")?;
        let mut inner = self.inner.lock().unwrap();
        if inner.containers.values().any(|c| c.name == config.name) {
            bail!("container name '{}' already in use", config.name);
        }
        inner.next_id += 1;
        let id = format!("mem{:08x}", inner.next_id);
        let host_port = if config.host_port != 0 {
            config.host_port
        } else {
            inner.next_port += 1;
            inner.next_port
        };
        inner.containers.insert(
            id.clone(),
            MemContainer {
                name: config.name.clone(),
                image: config.image.clone(),
                host_port,
                data_dir: config.data_dir.clone(),
                wal_archive_dir: config.wal_archive_dir.clone(),
                status: ContainerStatus::Created,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.check_fail("start_container")?;
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.status = ContainerStatus::Running;
                Ok(())
            }
            None => bail!("no such container: {}", id),
        }
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u32) -> Result<()> {
        self.check_fail("stop_container")?;
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.status = ContainerStatus::Exited;
                Ok(())
            }
            None => bail!("no such container: {}", id),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        self.check_fail("remove_container")?;
        let mut inner = self.inner.lock().unwrap();
        let Some(c) = inner.containers.get(id) else {
            bail!("no such container: {}", id);
        };
        if c.status.is_running() && !force {
            bail!("cannot remove running container {} without force", id);
        }
        inner.containers.remove(id);
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        self.stop_container(id, 10).await?;
        self.start_container(id).await
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.status.clone())
            .ok_or_else(|| anyhow::anyhow!("no such container: {}", id))
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .values()
            .any(|c| c.name == name))
    }

    async fn container_by_name(&self, name: &str) -> Result<Option<ContainerInfo>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: c.name.clone(),
                status: c.status.clone(),
            }))
    }

    async fn container_port(&self, id: &str) -> Result<u16> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.host_port)
            .ok_or_else(|| anyhow::anyhow!("no such container: {}", id))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .iter()
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: c.name.clone(),
                status: c.status.clone(),
            })
            .collect())
    }

    async fn wait_for_healthy(&self, id: &str, _user: &str, _timeout: Duration) -> Result<()> {
        self.check_fail("wait_for_healthy")?;
        let status = self.container_status(id).await?;
        if !status.is_running() {
            bail!("container {} did not become ready: status {:?}", id, status);
        }
        Ok(())
    }

    async fn exec_sql(&self, id: &str, sql: &str, _user: &str, _db: &str) -> Result<String> {
        self.check_fail("exec_sql")?;
        let mut inner = self.inner.lock().unwrap();
        let Some(c) = inner.containers.get(id) else {
            bail!("no such container: {}", id);
        };
        if !c.status.is_running() {
            bail!("container {} is not running", id);
        }
        let name = c.name.clone();
        inner.sql_log.push((name, sql.to_string()));
        Ok(String::new())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.check_fail("pull_image")?;
        self.inner.lock().unwrap().images.insert(image.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().images.contains(image))
    }

    async fn start_backup_mode(&self, id: &str, user: &str, db: &str) -> Result<()> {
        self.exec_sql(id, "SELECT pg_backup_start('pgbranch', true);", user, db)
            .await?;
        Ok(())
    }

    async fn stop_backup_mode(&self, id: &str, user: &str, db: &str) -> Result<()> {
        self.exec_sql(id, "SELECT pg_backup_stop();", user, db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, port: u16) -> ContainerConfig {
        ContainerConfig {
            name: name.to_string(),
            image: "postgres:17-alpine".into(),
            username: "postgres".into(),
            password: "pw".into(),
            database: "postgres".into(),
            data_dir: "/data".into(),
            wal_archive_dir: "/wal".into(),
            cert_dir: "/certs".into(),
            host_port: port,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_and_port_assignment() {
        let docker = MemDocker::new();
        let id = docker
            .create_container(&config("pgbranch-demo-main", 0))
            .await
            .unwrap();

        assert_eq!(
            docker.container_status(&id).await.unwrap(),
            ContainerStatus::Created
        );
        let port = docker.container_port(&id).await.unwrap();
        assert!(port > 49153);

        docker.start_container(&id).await.unwrap();
        docker
            .wait_for_healthy(&id, "postgres", Duration::from_secs(1))
            .await
            .unwrap();

        docker.stop_container(&id, 10).await.unwrap();
        docker.remove_container(&id, true).await.unwrap();
        assert!(!docker.container_exists("pgbranch-demo-main").await.unwrap());
    }

    #[tokio::test]
    async fn test_fixed_port_preserved() {
        let docker = MemDocker::new();
        let id = docker
            .create_container(&config("pgbranch-demo-dev", 49200))
            .await
            .unwrap();
        assert_eq!(docker.container_port(&id).await.unwrap(), 49200);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let docker = MemDocker::new();
        docker.create_container(&config("x", 0)).await.unwrap();
        assert!(docker.create_container(&config("x", 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_backup_mode_round_trip() {
        let docker = MemDocker::new();
        let id = docker.create_container(&config("x", 0)).await.unwrap();
        docker.start_container(&id).await.unwrap();

        docker.start_backup_mode(&id, "postgres", "postgres").await.unwrap();
        docker.stop_backup_mode(&id, "postgres", "postgres").await.unwrap();

        let sql: Vec<String> = docker.sql_log().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            sql,
            vec![
                "SELECT pg_backup_start('pgbranch', true);".to_string(),
                "SELECT pg_backup_stop();".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_sql_requires_running() {
        let docker = MemDocker::new();
        let id = docker.create_container(&config("x", 0)).await.unwrap();
        assert!(docker.exec_sql(&id, "CHECKPOINT;", "postgres", "postgres").await.is_err());

        docker.start_container(&id).await.unwrap();
        docker
            .exec_sql(&id, "CHECKPOINT;", "postgres", "postgres")
            .await
            .unwrap();
        assert_eq!(docker.sql_log(), vec![("x".to_string(), "CHECKPOINT;".to_string())]);
    }
}

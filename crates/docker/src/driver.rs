//! `docker` CLI implementation of the driver trait

use crate::{
    ContainerConfig, ContainerDriver, ContainerInfo, ContainerStatus, READY_POLL_INTERVAL,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::process::Command;

pub struct Docker;

impl Docker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Docker {
    fn default() -> Self {
        Self::new()
    }
}

struct DockerOutput {
    status_ok: bool,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

async fn docker(args: &[&str]) -> Result<DockerOutput> {
    tracing::debug!("exec: docker {}", args.join(" "));
    let output = Command::new("docker")
        .args(args)
        .output()
        .await
        .context("failed to run 'docker' - is the daemon installed and reachable?")?;
    Ok(DockerOutput {
        status_ok: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

async fn docker_checked(args: &[&str]) -> Result<String> {
    let out = docker(args).await?;
    if !out.status_ok {
        anyhow::bail!("docker {} failed: {}", args.join(" "), out.stderr);
    }
    Ok(out.stdout)
}

#[async_trait]
impl ContainerDriver for Docker {
    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        let args = config.to_create_args();
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = docker_checked(&refs).await?;
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        docker_checked(&["start", id]).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<()> {
        let t = timeout_secs.to_string();
        docker_checked(&["stop", "-t", &t, id]).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        if force {
            docker_checked(&["rm", "-f", id]).await?;
        } else {
            docker_checked(&["rm", id]).await?;
        }
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        docker_checked(&["restart", id]).await?;
        Ok(())
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        let out = docker_checked(&["inspect", "-f", "{{.State.Status}}", id]).await?;
        Ok(ContainerStatus::parse(&out))
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.container_by_name(name).await?.is_some())
    }

    async fn container_by_name(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let filter = format!("name=^{}$", name);
        let out = docker_checked(&[
            "ps",
            "-a",
            "--filter",
            &filter,
            "--format",
            "{{.ID}}\t{{.Names}}\t{{.State}}",
        ])
        .await?;
        for line in out.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            // The name filter is a regex; verify the exact name.
            if fields.len() == 3 && fields[1] == name {
                return Ok(Some(ContainerInfo {
                    id: fields[0].to_string(),
                    name: fields[1].to_string(),
                    status: ContainerStatus::parse(fields[2]),
                }));
            }
        }
        Ok(None)
    }

    async fn container_port(&self, id: &str) -> Result<u16> {
        let out = docker_checked(&["port", id, "5432/tcp"]).await?;
        // "0.0.0.0:49153" (possibly followed by an IPv6 line)
        let first = out
            .lines()
            .next()
            .context("container has no published port for 5432/tcp")?;
        let port = first
            .rsplit(':')
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .with_context(|| format!("unparseable docker port output '{}'", first))?;
        Ok(port)
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let out = docker_checked(&[
            "ps",
            "-a",
            "--format",
            "{{.ID}}\t{{.Names}}\t{{.State}}",
        ])
        .await?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split('\t').collect();
                (fields.len() == 3).then(|| ContainerInfo {
                    id: fields[0].to_string(),
                    name: fields[1].to_string(),
                    status: ContainerStatus::parse(fields[2]),
                })
            })
            .collect())
    }

    async fn wait_for_healthy(&self, id: &str, user: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.container_status(id).await?;
            if status.is_running() {
                let probe = docker(&["exec", id, "pg_isready", "-U", user]).await?;
                if probe.exit_code == Some(0) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "container {} did not become ready within {}s",
                    id,
                    timeout.as_secs()
                );
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn exec_sql(&self, id: &str, sql: &str, user: &str, db: &str) -> Result<String> {
        let out = docker(&[
            "exec", id, "psql", "-U", user, "-d", db, "-t", "-A", "-c", sql,
        ])
        .await?;
        if !out.status_ok || !out.stderr.is_empty() {
            anyhow::bail!("{}", out.stderr);
        }
        Ok(out.stdout)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        docker_checked(&["pull", image]).await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let out = docker(&["image", "inspect", image]).await?;
        Ok(out.status_ok)
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

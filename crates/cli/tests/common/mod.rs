//! Fixtures for controller integration tests
//!
//! Wires the command layer to in-memory drivers under a TempDir so every
//! test drives the exact code paths the binary uses, minus the host.

use async_trait::async_trait;
use pgbranch_cli::config::SystemConfig;
use pgbranch_cli::ctx::Ctx;
use pgbranch_cli::ssl::CertProvider;
use pgbranch_docker::testing::MemDocker;
use pgbranch_zfs::testing::MemZfs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Fixture {
    /// Keeps the backing directories alive for the test's duration.
    #[allow(dead_code)]
    pub temp: TempDir,
    pub ctx: Ctx,
    pub zfs: Arc<MemZfs>,
    pub docker: Arc<MemDocker>,
}

struct FakeCerts;

#[async_trait]
impl CertProvider for FakeCerts {
    async fn ensure_project_certs(&self, dir: &Path, _common_name: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("server.crt"), "test certificate")?;
        std::fs::write(dir.join("server.key"), "test key")?;
        Ok(())
    }
}

pub fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("config");
    std::fs::create_dir_all(&root).unwrap();

    let zfs = Arc::new(MemZfs::new(temp.path().join("zfs")));
    let docker = Arc::new(MemDocker::new());
    let ctx = Ctx::with_parts(
        root,
        SystemConfig::default(),
        zfs.clone(),
        docker.clone(),
        Arc::new(FakeCerts),
    );
    ctx.mark_setup_complete().unwrap();

    Fixture {
        temp,
        ctx,
        zfs,
        docker,
    }
}

pub async fn create_project(f: &Fixture, name: &str) {
    pgbranch_cli::cmd::project::create(&f.ctx, name, None, None, None)
        .await
        .unwrap_or_else(|e| panic!("project create {} failed: {:#}", name, e));
}

pub async fn create_branch(f: &Fixture, name: &str) {
    pgbranch_cli::cmd::branch::create(&f.ctx, name, None, None)
        .await
        .unwrap_or_else(|e| panic!("branch create {} failed: {:#}", name, e));
}

pub fn load_state(f: &Fixture) -> pgbranch_state::State {
    f.ctx.store.load().unwrap().expect("state should exist")
}

pub fn state_bytes(f: &Fixture) -> String {
    std::fs::read_to_string(f.ctx.store.path()).unwrap()
}

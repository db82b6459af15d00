//! Per-project SSL certificates
//!
//! Each project gets a self-signed pair under `<config root>/certs/<project>/`
//! that every branch container mounts read-only. PostgreSQL refuses a key
//! readable by the world, so the key is tightened to 0600 and handed to the
//! in-container postgres user.

use anyhow::{Context, Result};
use async_trait::async_trait;
use pgbranch_wal::{POSTGRES_GID, POSTGRES_UID};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::process::Command;

#[async_trait]
pub trait CertProvider: Send + Sync {
    /// Ensure `dir` holds a server.crt/server.key pair for the project.
    /// Idempotent: an existing pair is left alone.
    async fn ensure_project_certs(&self, dir: &Path, common_name: &str) -> Result<()>;
}

/// Generates certificates with the system `openssl` binary.
pub struct OpensslCerts;

#[async_trait]
impl CertProvider for OpensslCerts {
    async fn ensure_project_certs(&self, dir: &Path, common_name: &str) -> Result<()> {
        let crt = dir.join("server.crt");
        let key = dir.join("server.key");
        if crt.exists() && key.exists() {
            return Ok(());
        }

        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let subj = format!("/CN={}", common_name);
        let output = Command::new("openssl")
            .args([
                "req",
                "-x509",
                "-newkey",
                "rsa:2048",
                "-nodes",
                "-days",
                "3650",
                "-subj",
                &subj,
                "-keyout",
            ])
            .arg(&key)
            .arg("-out")
            .arg(&crt)
            .output()
            .await
            .context("failed to run 'openssl'")?;

        if !output.status.success() {
            anyhow::bail!(
                "openssl certificate generation failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        fs::set_permissions(&key, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to chmod {}", key.display()))?;
        if let Err(e) = nix::unistd::chown(
            &key,
            Some(nix::unistd::Uid::from_raw(POSTGRES_UID)),
            Some(nix::unistd::Gid::from_raw(POSTGRES_GID)),
        ) {
            tracing::debug!("could not chown {} to postgres user: {}", key.display(), e);
        }

        tracing::info!("generated SSL certificate for {}", common_name);
        Ok(())
    }
}

//! Subprocess plumbing for zfs/zpool invocations

use anyhow::{Context, Result};
use tokio::process::Command;

pub(crate) struct CmdOutput {
    pub status_ok: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command and capture both streams. Spawn failures (binary missing,
/// permission) are errors; a non-zero exit is reported in the output so
/// callers can classify benign conditions before failing.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<CmdOutput> {
    tracing::debug!("exec: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run '{}'", program))?;

    Ok(CmdOutput {
        status_ok: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
    })
}

/// Run a command and fail on non-zero exit, with stderr as the message.
pub(crate) async fn run_checked(program: &str, args: &[&str]) -> Result<String> {
    let out = run(program, args).await?;
    if !out.status_ok {
        anyhow::bail!("{} {} failed: {}", program, args.join(" "), out.stderr);
    }
    Ok(out.stdout)
}

//! Advisory file lock for the state document
//!
//! Guards the read-modify-write window across processes. The lock file
//! contains the holder's pid; a dead holder is detected by a liveness probe
//! and the lock reclaimed. Acquisition polls at 100 ms and gives up after
//! 5 seconds.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Held lock on the state file. Deleting the lock file releases it; the
/// Drop impl guarantees release even on an error path.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    /// Acquire the lock at `path`, reclaiming it from dead holders.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .context("failed to write pid to lock file")?;
                    file.sync_all()?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(holder) = read_holder_pid(path) {
                        if !is_process_alive(holder) {
                            tracing::warn!(
                                "removing stale state lock held by dead pid {}",
                                holder
                            );
                            let _ = std::fs::remove_file(path);
                            continue;
                        }
                    }
                    if Instant::now() >= deadline {
                        let holder = read_holder_pid(path)
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        anyhow::bail!(
                            "timed out acquiring state lock at {} (held by pid {})",
                            path.display(),
                            holder
                        );
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create lock file {}", path.display())
                    });
                }
            }
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_holder_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(target_os = "macos")]
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true, // Permission denied or other - assume alive
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

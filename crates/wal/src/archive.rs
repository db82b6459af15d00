//! Per-branch WAL archive directories
//!
//! Every branch archives its WAL into `<root>/<project>-<branch>/`, bind
//! mounted into its container at /wal-archive. The directory is owned by
//! the in-container postgres user so archive_command can write to it.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// UID/GID of the postgres user in the Alpine PostgreSQL image.
pub const POSTGRES_UID: u32 = 70;
pub const POSTGRES_GID: u32 = 70;

const ARCHIVE_DIR_MODE: u32 = 0o770;

#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub file_count: usize,
    pub total_bytes: u64,
    pub oldest_name: Option<String>,
    pub newest_name: Option<String>,
    pub oldest_mtime: Option<DateTime<Utc>>,
    pub newest_mtime: Option<DateTime<Utc>>,
}

pub struct WalArchive {
    root: PathBuf,
}

impl WalArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Archive directory for a dataset (`<project>-<branch>`).
    pub fn archive_path(&self, dataset: &str) -> PathBuf {
        self.root.join(dataset)
    }

    /// Create the archive directory with mode 0770 owned by the postgres
    /// container user, plus a `.keep` placeholder. Idempotent; re-running
    /// re-asserts mode and ownership.
    pub fn ensure_archive_dir(&self, dataset: &str) -> Result<PathBuf> {
        let dir = self.archive_path(dataset);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(ARCHIVE_DIR_MODE))
            .with_context(|| format!("failed to chmod {}", dir.display()))?;

        // Ownership needs privilege; outside the deployed host (tests,
        // doctor dry-runs) the chown is not possible and not needed.
        if let Err(e) = nix::unistd::chown(
            &dir,
            Some(nix::unistd::Uid::from_raw(POSTGRES_UID)),
            Some(nix::unistd::Gid::from_raw(POSTGRES_GID)),
        ) {
            tracing::debug!("could not chown {} to postgres user: {}", dir.display(), e);
        }

        let keep = dir.join(".keep");
        if !keep.exists() {
            fs::write(&keep, b"")
                .with_context(|| format!("failed to create {}", keep.display()))?;
        }
        Ok(dir)
    }

    /// Remove the archive directory and everything in it. Missing is fine.
    pub fn delete_archive_dir(&self, dataset: &str) -> Result<()> {
        let dir = self.archive_path(dataset);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", dir.display())),
        }
    }

    /// Scan the archive. Dotfiles (`.keep` included) are not WAL and are
    /// excluded from every figure.
    pub fn archive_info(&self, dataset: &str) -> Result<ArchiveInfo> {
        let mut names: Vec<(String, u64, DateTime<Utc>)> = Vec::new();
        let dir = self.archive_path(dataset);
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let meta = entry.metadata()?;
                if !meta.is_file() {
                    continue;
                }
                let mtime: DateTime<Utc> = meta.modified()?.into();
                names.push((name, meta.len(), mtime));
            }
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let total_bytes = names.iter().map(|(_, len, _)| len).sum();
        let oldest_mtime = names.iter().map(|(_, _, m)| *m).min();
        let newest_mtime = names.iter().map(|(_, _, m)| *m).max();
        Ok(ArchiveInfo {
            file_count: names.len(),
            total_bytes,
            oldest_name: names.first().map(|(n, _, _)| n.clone()),
            newest_name: names.last().map(|(n, _, _)| n.clone()),
            oldest_mtime,
            newest_mtime,
        })
    }

    /// WAL file names modified before the cutoff, without deleting.
    pub fn files_before(&self, dataset: &str, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let dir = self.archive_path(dataset);
        let mut names = Vec::new();
        if !dir.exists() {
            return Ok(names);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let mtime: DateTime<Utc> = meta.modified()?.into();
            if mtime < cutoff {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete WAL files modified before the cutoff; returns how many.
    pub fn cleanup_before(&self, dataset: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let dir = self.archive_path(dataset);
        if !dir.exists() {
            return Ok(0);
        }
        let mut deleted = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let mtime: DateTime<Utc> = meta.modified()?.into();
            if mtime < cutoff {
                fs::remove_file(entry.path())
                    .with_context(|| format!("failed to delete {}", name))?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn cleanup_older_than(&self, dataset: &str, days: i64) -> Result<usize> {
        self.cleanup_before(dataset, Utc::now() - Duration::days(days))
    }

    /// Check the archive for missing segments: sort names, interpret each
    /// 24-hex-digit name as a WAL sequence number, and report every skipped
    /// position as `<expected name>`.
    pub fn verify_integrity(&self, dataset: &str) -> Result<Vec<String>> {
        let dir = self.archive_path(dataset);
        let mut segments: Vec<(String, u64, u64)> = Vec::new();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let name = entry?.file_name().to_string_lossy().to_string();
                if let Some((timeline, seq)) = parse_wal_name(&name) {
                    segments.push((name, timeline, seq));
                }
            }
        }
        segments.sort_by(|a, b| a.0.cmp(&b.0));

        let mut gaps = Vec::new();
        for window in segments.windows(2) {
            let (_, timeline, prev) = &window[0];
            let (_, next_timeline, next) = &window[1];
            if timeline != next_timeline {
                continue;
            }
            let mut expected = prev + 1;
            while expected < *next {
                gaps.push(wal_name(*timeline, expected));
                expected += 1;
            }
        }
        Ok(gaps)
    }
}

/// Split a WAL segment file name into (timeline, sequence). The sequence
/// combines the log and segment ids so consecutive segments differ by one.
fn parse_wal_name(name: &str) -> Option<(u64, u64)> {
    if name.len() != 24 || !name.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let timeline = u64::from_str_radix(&name[0..8], 16).ok()?;
    let log = u64::from_str_radix(&name[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&name[16..24], 16).ok()?;
    Some((timeline, (log << 8) | (seg & 0xFF)))
}

fn wal_name(timeline: u64, seq: u64) -> String {
    format!("{:08X}{:08X}{:08X}", timeline, seq >> 8, seq & 0xFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn archive(temp: &TempDir) -> WalArchive {
        WalArchive::new(temp.path().join("wal-archive"))
    }

    #[test]
    fn test_ensure_archive_dir_mode_idempotent() {
        let temp = TempDir::new().unwrap();
        let wal = archive(&temp);

        for _ in 0..3 {
            let dir = wal.ensure_archive_dir("demo-main").unwrap();
            let mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o7777;
            assert_eq!(mode, 0o770, "archive dir must be 0770, got {:o}", mode);
            assert!(dir.join(".keep").exists());
        }
    }

    #[test]
    fn test_archive_info_excludes_dotfiles() {
        let temp = TempDir::new().unwrap();
        let wal = archive(&temp);
        let dir = wal.ensure_archive_dir("demo-main").unwrap();

        fs::write(dir.join("000000010000000000000001"), vec![0u8; 16]).unwrap();
        fs::write(dir.join("000000010000000000000002"), vec![0u8; 32]).unwrap();

        let info = wal.archive_info("demo-main").unwrap();
        assert_eq!(info.file_count, 2);
        assert_eq!(info.total_bytes, 48);
        assert_eq!(info.oldest_name.as_deref(), Some("000000010000000000000001"));
        assert_eq!(info.newest_name.as_deref(), Some("000000010000000000000002"));
    }

    #[test]
    fn test_archive_info_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        let info = archive(&temp).archive_info("nope").unwrap();
        assert_eq!(info.file_count, 0);
        assert!(info.oldest_name.is_none());
    }

    #[test]
    fn test_cleanup_before() {
        let temp = TempDir::new().unwrap();
        let wal = archive(&temp);
        let dir = wal.ensure_archive_dir("demo-main").unwrap();
        fs::write(dir.join("000000010000000000000001"), b"x").unwrap();
        fs::write(dir.join("000000010000000000000002"), b"x").unwrap();

        // Everything on disk is newer than a past cutoff.
        let deleted = wal
            .cleanup_before("demo-main", Utc::now() - Duration::days(1))
            .unwrap();
        assert_eq!(deleted, 0);

        // A future cutoff sweeps both, but never the .keep file.
        let deleted = wal
            .cleanup_before("demo-main", Utc::now() + Duration::days(1))
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(dir.join(".keep").exists());
    }

    #[test]
    fn test_verify_integrity_reports_gaps() {
        let temp = TempDir::new().unwrap();
        let wal = archive(&temp);
        let dir = wal.ensure_archive_dir("demo-main").unwrap();
        for name in [
            "000000010000000000000001",
            "000000010000000000000002",
            "000000010000000000000005",
        ] {
            fs::write(dir.join(name), b"x").unwrap();
        }

        let gaps = wal.verify_integrity("demo-main").unwrap();
        assert_eq!(
            gaps,
            vec![
                "000000010000000000000003".to_string(),
                "000000010000000000000004".to_string()
            ]
        );
    }

    #[test]
    fn test_verify_integrity_crosses_log_boundary() {
        let temp = TempDir::new().unwrap();
        let wal = archive(&temp);
        let dir = wal.ensure_archive_dir("demo-main").unwrap();
        // FF is the last segment of log 0; the next segment is log 1 seg 0.
        fs::write(dir.join("0000000100000000000000FF"), b"x").unwrap();
        fs::write(dir.join("000000010000000100000000"), b"x").unwrap();

        assert!(wal.verify_integrity("demo-main").unwrap().is_empty());
    }

    #[test]
    fn test_verify_integrity_ignores_non_wal() {
        let temp = TempDir::new().unwrap();
        let wal = archive(&temp);
        let dir = wal.ensure_archive_dir("demo-main").unwrap();
        fs::write(dir.join("000000010000000000000001"), b"x").unwrap();
        fs::write(dir.join("000000010000000000000002.partial"), b"x").unwrap();
        fs::write(dir.join("00000002.history"), b"x").unwrap();

        assert!(wal.verify_integrity("demo-main").unwrap().is_empty());
    }
}

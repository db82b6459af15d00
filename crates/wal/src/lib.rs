//! WAL archives, application-consistent snapshots, and point-in-time
//! recovery support.

mod archive;
mod pitr;
mod snapshot;

pub use archive::{ArchiveInfo, WalArchive, POSTGRES_GID, POSTGRES_UID};
pub use pitr::{parse_recovery_target, select_snapshot_before, write_recovery_files};
pub use snapshot::{create_consistent_snapshot, SnapshotOutcome};

//! Persistent state for pgbranch: the data model, its invariants, and a
//! crash-safe JSON store with inter-process locking.

mod error;
mod lock;
mod model;
mod names;
mod store;
mod validate;

pub use error::{user_error, user_error_with_hint, UserError};
pub use lock::StateLock;
pub use model::{
    Branch, BranchStatus, Credentials, Project, Snapshot, State, STATE_VERSION,
};
pub use names::{
    container_name, full_dataset_path, full_snapshot_name, snapshot_stamp, validate_name,
    BranchRef, CONTAINER_PREFIX, MAIN_BRANCH,
};
pub use store::StateStore;
pub use validate::validate;

//! On-disk layout of shared-memory group metadata.
//!
//! A group is a named set of cooperating processes. Its metadata lives on
//! the RAM disk under `/dev/shm/group_<NAME>/`; the `buddies` file inside
//! holds the persistent buddy-tree state and is the sole mandatory
//! artifact. Pool backing files are created next to it.

use crate::error::{Error, Result};
use std::path::PathBuf;

/// RAM-disk directory holding all group metadata.
pub const META_HOME: &str = "/dev/shm";

/// Prefix of a group's metadata directory name.
pub const META_PREFIX: &str = "group_";

/// Name of the buddy-tree state file inside a group directory.
pub const BUDDIES_FILE: &str = "buddies";

/// Validate a group name: non-empty, no path separators, no NUL.
pub fn validate_name(group: &str) -> Result<()> {
    if group.is_empty() {
        return Err(Error::InvalidArgument("empty group name".to_string()));
    }
    if group.contains('/') || group.contains('\0') {
        return Err(Error::InvalidArgument(format!(
            "group name {group:?} contains a path separator or NUL"
        )));
    }
    Ok(())
}

/// Metadata directory of a group: `/dev/shm/group_<NAME>`.
pub fn group_dir(group: &str) -> Result<PathBuf> {
    validate_name(group)?;
    Ok(PathBuf::from(META_HOME).join(format!("{META_PREFIX}{group}")))
}

/// Buddy-tree state file of a group: `/dev/shm/group_<NAME>/buddies`.
pub fn buddies_path(group: &str) -> Result<PathBuf> {
    Ok(group_dir(group)?.join(BUDDIES_FILE))
}

/// Backing file of the pool at `offset` inside a group's window.
pub(crate) fn pool_path(group: &str, offset: u64) -> Result<PathBuf> {
    Ok(group_dir(group)?.join(format!("pool_{offset:x}")))
}

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SwarmError};

pub const LOCK_FILE: &str = ".swarmjob.lock";

/// Marks a download root as owned by a running node. Removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock of `root`. Returns `None` when another instance holds it.
    pub fn acquire(root: &Path) -> Result<Option<Self>> {
        let path = root.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(SwarmError::io("open", e)),
        };
        writeln!(file, "{}", std::process::id()).map_err(|e| SwarmError::io("write", e))?;
        Ok(Some(Self { path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_released() {
        let root = tempfile::tempdir().unwrap();
        let lock = InstanceLock::acquire(root.path()).unwrap().unwrap();
        assert!(lock.path().exists());
        assert!(InstanceLock::acquire(root.path()).unwrap().is_none());

        drop(lock);
        assert!(!root.path().join(LOCK_FILE).exists());
        assert!(InstanceLock::acquire(root.path()).unwrap().is_some());
    }
}

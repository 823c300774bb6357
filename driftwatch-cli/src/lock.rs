//! Advisory run lock -- one driftwatch process per state file.
//!
//! An exclusive `flock` on `<state-file>.lock`, taken before any rule
//! runs and held until process exit. A second invocation against the same
//! state file fails immediately instead of corrupting the document.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::debug;

pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock guarding `state_file`, failing fast if another
    /// run holds it.
    pub fn acquire(state_file: &Path) -> Result<Self> {
        let path = lock_path(state_file);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file '{}'", path.display()))?;
        file.try_lock_exclusive().with_context(|| {
            format!(
                "another run holds the lock '{}', exiting",
                path.display()
            )
        })?;
        debug!(path = %path.display(), "run lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path(state_file: &Path) -> PathBuf {
    let mut name = state_file.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

use crate::config::Layout;
use crate::error::JupyError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Advisory lock over one environment's on-disk state.
///
/// Only one jupyagent process may run setup/build/up/down at a time. The lock
/// is released when the guard drops, on every exit path.
#[derive(Debug)]
pub struct EnvLock {
    file: File,
    path: PathBuf,
}

impl EnvLock {
    pub fn acquire(layout: &Layout) -> Result<Self, JupyError> {
        fs::create_dir_all(layout.root())?;
        let path = layout.lock_file();
        // Open without truncating so a live holder's PID survives a failed attempt.
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| JupyError::Locked(path.clone()))?;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!(path = %path.display(), "environment lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for EnvLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release environment lock");
        }
    }
}

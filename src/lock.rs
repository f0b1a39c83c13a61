//! Single-instance lock for the supervisor.
//!
//! Two supervisors on the same settings file would fight over the link and
//! double-count connected time, so `run` takes an exclusive advisory lock on
//! `<settings>.lock` for its lifetime.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Held for as long as the supervisor runs; unlocked on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Lock file path for a settings file.
    pub fn path_for(settings: &Path) -> PathBuf {
        let mut name = settings.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Take the lock without blocking.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| LockError::Open {
                path: path.clone(),
                source: e,
            })?;

        file.try_lock_exclusive()
            .map_err(|_| LockError::Held { path: path.clone() })?;
        tracing::debug!(path = %path.display(), "acquired instance lock");
        Ok(Self { file, path })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if FileExt::unlock(&self.file).is_ok() {
            tracing::debug!(path = %self.path.display(), "released instance lock");
        }
    }
}

#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Held {
        path: PathBuf,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {source}", path.display())
            }
            LockError::Held { path } => {
                write!(
                    f,
                    "another supervisor is already running (lock {} is held)",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Held { .. } => None,
        }
    }
}

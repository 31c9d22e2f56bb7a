use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs4::FileExt;

use snapvault_types::{Result, SnapError};

/// Exclusive advisory lock over the cache directory, held for the
/// duration of any write. Readers never take it; they revalidate
/// checksums instead.
///
/// The guard releases the OS lock on drop. The lock file itself is left
/// in place; its content (pid/time of the current holder) is diagnostic
/// only.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
}

impl CacheLock {
    /// Acquire the writer lock, blocking until the current holder
    /// releases it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        file.lock_exclusive()?;
        Self::stamp(&file);
        Ok(Self { file })
    }

    /// Acquire the writer lock without blocking. A held lock surfaces as
    /// `SnapError::Locked` with the holder's recorded identity.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                Self::stamp(&file);
                Ok(Self { file })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let holder = std::fs::read_to_string(path)
                    .unwrap_or_default()
                    .trim()
                    .replace('\n', ", ");
                Err(SnapError::Locked(if holder.is_empty() {
                    "unknown holder".into()
                } else {
                    holder
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    }

    /// Best-effort holder info; failures here never block the write path.
    fn stamp(mut file: &File) {
        let _ = file.set_len(0);
        let _ = write!(
            file,
            "pid:{}\ntime:{}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        let _ = file.flush();
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("failed to release cache lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_records_holder_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache_lock");
        let _guard = CacheLock::acquire(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&format!("pid:{}", std::process::id())));
    }

    #[test]
    fn reacquire_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache_lock");
        {
            let _guard = CacheLock::acquire(&path).unwrap();
        }
        // Released on drop; a second acquire must not block.
        let _guard = CacheLock::try_acquire(&path).unwrap();
    }
}

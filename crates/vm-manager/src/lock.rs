use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, VmError};

/// Guards writes to a JSON file with an exclusive advisory lock on a sibling
/// `<file>.lock`, per spec.md §4.1/§9. The lock is released when the guard
/// drops (via `fs2`, which unlocks on `File` close).
pub struct LockedFile {
    _lock: File,
    path: PathBuf,
}

impl LockedFile {
    /// Acquire an exclusive lock on `<path>.lock`, blocking the calling thread.
    pub fn acquire(path: &Path) -> Result<Self> {
        let lock_path = lock_path_for(path);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VmError::io(format!("create {}", parent.display()), e))?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| VmError::io(format!("open {}", lock_path.display()), e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| VmError::io(format!("lock {}", lock_path.display()), e))?;
        Ok(Self {
            _lock: lock_file,
            path: path.to_path_buf(),
        })
    }

    /// Truncate-and-write `contents` to the guarded path while holding the lock.
    pub fn write(&self, contents: &[u8]) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| VmError::io(format!("write {}", self.path.display()), e))?;
        f.write_all(contents)
            .map_err(|e| VmError::io(format!("write {}", self.path.display()), e))?;
        f.sync_all()
            .map_err(|e| VmError::io(format!("sync {}", self.path.display()), e))
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".lock");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        {
            let guard = LockedFile::acquire(&path).unwrap();
            guard.write(b"{\"a\":1}").unwrap();
        }
        let read = std::fs::read_to_string(&path).unwrap();
        assert_eq!(read, "{\"a\":1}");
        assert!(lock_path_for(&path).exists());
    }

    #[test]
    fn lock_released_on_drop_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        {
            let _g = LockedFile::acquire(&path).unwrap();
        }
        let _g2 = LockedFile::acquire(&path).unwrap();
    }
}

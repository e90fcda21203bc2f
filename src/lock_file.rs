//! `P.lock` (§6): an advisory exclusive lock preventing a second process
//! from opening the same data file.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use fathom_common::{Error, Result};

pub struct LockFile {
    file: File,
}

impl LockFile {
    /// Acquire the advisory lock at `path`, creating the file if absent.
    /// Fails immediately (rather than blocking) if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::CorruptDatabase(format!(
                "{} is already locked by another process",
                path.display()
            ))
        })?;
        Ok(Self { file })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_on_same_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lock");
        let _first = LockFile::acquire(&path).unwrap();
        assert!(LockFile::acquire(&path).is_err());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lock");
        {
            let _first = LockFile::acquire(&path).unwrap();
        }
        let _second = LockFile::acquire(&path).unwrap();
    }
}

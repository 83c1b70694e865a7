use std::fmt;
use std::fs::File;
use std::io;

use log::{trace, warn};
use parking_lot::Mutex;

use crate::error::RecStoreResult;

/// Lock capability over an open file. The rest of the crate only sees this trait.
pub trait FileLock: Send + Sync + fmt::Debug {
    fn lock_shared(&self, file: &File) -> io::Result<()>;
    fn lock_exclusive(&self, file: &File) -> io::Result<()>;
    fn unlock(&self, file: &File) -> io::Result<()>;
}

/// OS advisory whole-file lock: `flock` on Unix, `LockFileEx` on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdvisoryLock;

impl FileLock for AdvisoryLock {
    fn lock_shared(&self, file: &File) -> io::Result<()> {
        fs4::FileExt::lock_shared(file)
    }

    fn lock_exclusive(&self, file: &File) -> io::Result<()> {
        fs4::FileExt::lock_exclusive(file)
    }

    fn unlock(&self, file: &File) -> io::Result<()> {
        fs4::FileExt::unlock(file)
    }
}

/// Takes no OS lock. For hosts that guarantee a single process per data directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLock;

impl FileLock for NoopLock {
    fn lock_shared(&self, _file: &File) -> io::Result<()> {
        Ok(())
    }

    fn lock_exclusive(&self, _file: &File) -> io::Result<()> {
        Ok(())
    }

    fn unlock(&self, _file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(not(feature = "no-advisory-lock"))]
pub type DefaultLock = AdvisoryLock;
#[cfg(feature = "no-advisory-lock")]
pub type DefaultLock = NoopLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Whole-file lock scoped to one table's data file.
///
/// Holds its own duplicated handle of the data file. Duplicated handles share
/// the open file description, so the lock covers every access made through the
/// store's handle as well. OS locks on one description do not nest, so shared
/// scopes are counted and the lock is released by the last one out.
#[derive(Debug)]
pub struct ConcurrencyGuard {
    file: File,
    backend: Box<dyn FileLock>,
    shared_holders: Mutex<usize>,
}

impl ConcurrencyGuard {
    pub fn new(file: File) -> Self {
        Self::with_backend(file, Box::new(DefaultLock::default()))
    }

    pub fn with_backend(file: File, backend: Box<dyn FileLock>) -> Self {
        Self {
            file,
            backend,
            shared_holders: Mutex::new(0),
        }
    }

    pub fn shared(&self) -> RecStoreResult<LockScope<'_>> {
        let mut holders = self.shared_holders.lock();
        if *holders == 0 {
            self.backend.lock_shared(&self.file)?;
            trace!("acquired shared file lock");
        }
        *holders += 1;
        Ok(LockScope {
            guard: self,
            mode: LockMode::Shared,
        })
    }

    pub fn exclusive(&self) -> RecStoreResult<LockScope<'_>> {
        self.backend.lock_exclusive(&self.file)?;
        trace!("acquired exclusive file lock");
        Ok(LockScope {
            guard: self,
            mode: LockMode::Exclusive,
        })
    }
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct LockScope<'a> {
    guard: &'a ConcurrencyGuard,
    mode: LockMode,
}

impl LockScope<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockScope<'_> {
    fn drop(&mut self) {
        if self.mode == LockMode::Shared {
            let mut holders = self.guard.shared_holders.lock();
            *holders -= 1;
            if *holders > 0 {
                return;
            }
        }
        if let Err(e) = self.guard.backend.unlock(&self.guard.file) {
            warn!("failed to release {:?} file lock: {}", self.mode, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AdvisoryLock, ConcurrencyGuard, LockMode, NoopLock};
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open(path: &std::path::Path) -> std::fs::File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn exclusive_scope_blocks_other_handles() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.dat");
        let guard = ConcurrencyGuard::with_backend(open(&path), Box::new(AdvisoryLock));
        let other = open(&path);

        {
            let scope = guard.exclusive().unwrap();
            assert_eq!(scope.mode(), LockMode::Exclusive);
            assert!(fs4::FileExt::try_lock_shared(&other).is_err());
        }
        // released on drop
        fs4::FileExt::try_lock_exclusive(&other).unwrap();
        fs4::FileExt::unlock(&other).unwrap();
    }

    #[test]
    fn shared_scopes_coexist() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.dat");
        let guard = ConcurrencyGuard::with_backend(open(&path), Box::new(AdvisoryLock));
        let other = open(&path);

        let _scope = guard.shared().unwrap();
        fs4::FileExt::try_lock_shared(&other).unwrap();
        assert!(fs4::FileExt::try_lock_exclusive(&other).is_err());
        fs4::FileExt::unlock(&other).unwrap();
    }

    #[test]
    fn nested_shared_scopes_release_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.dat");
        let guard = ConcurrencyGuard::with_backend(open(&path), Box::new(AdvisoryLock));
        let other = open(&path);

        let first = guard.shared().unwrap();
        let second = guard.shared().unwrap();
        drop(first);
        // still held by the second scope
        assert!(fs4::FileExt::try_lock_exclusive(&other).is_err());
        drop(second);
        fs4::FileExt::try_lock_exclusive(&other).unwrap();
        fs4::FileExt::unlock(&other).unwrap();
    }

    #[test]
    fn noop_backend_never_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.dat");
        let guard = ConcurrencyGuard::with_backend(open(&path), Box::new(NoopLock));
        let other = open(&path);

        let _scope = guard.exclusive().unwrap();
        fs4::FileExt::try_lock_exclusive(&other).unwrap();
        fs4::FileExt::unlock(&other).unwrap();
    }
}

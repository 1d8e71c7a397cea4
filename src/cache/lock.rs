//! Cross-process locks on the index file.
//!
//! Two kinds of lock live here:
//! - [`InitLock`]: an exclusive whole-file lock held while an index file is
//!   created or validated, so racing openers see a single initialization.
//! - [`RangeLocker`]: exclusive advisory byte-range locks, one lock byte per
//!   block, held while a run of blocks is fetched and written.
//!
//! On Linux the range locks are open-file-description locks, which exclude
//! each other between separately opened cache instances even inside one
//! process. Other Unix targets use classic POSIX record locks, which are
//! per process. Threads sharing one cache instance are serialized by the
//! pending-fetch registry, not by these locks.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::trace;

use crate::cache::error::CacheError;
use crate::cache::range::BlockSpan;

/// Exclusive lock on a whole file, released on drop.
pub struct InitLock {
    file: File,
}

impl InitLock {
    /// Block until the exclusive lock on `file` is held.
    pub fn acquire(file: &File) -> io::Result<Self> {
        let file = file.try_clone()?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for InitLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Hands out exclusive locks over block spans of one index file.
pub struct RangeLocker {
    path: PathBuf,
    file: File,
}

/// A held range lock. Dropping it releases the range.
pub struct RangeLockGuard<'a> {
    locker: &'a RangeLocker,
    span: BlockSpan,
}

impl RangeLocker {
    pub fn new(path: &Path, file: File) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
        }
    }

    /// Block until `span` is exclusively locked.
    pub fn lock(&self, span: BlockSpan) -> Result<RangeLockGuard<'_>, CacheError> {
        sys::lock(&self.file, span, true).map_err(|source| CacheError::Lock {
            first_block: span.first,
            end_block: span.end,
            source,
        })?;
        trace!(path = %self.path.display(), %span, "Range lock acquired");
        Ok(RangeLockGuard { locker: self, span })
    }

    /// Lock `span` if nobody else holds any part of it.
    ///
    /// Returns `Ok(None)` when the range is held elsewhere.
    pub fn try_lock(&self, span: BlockSpan) -> Result<Option<RangeLockGuard<'_>>, CacheError> {
        match sys::lock(&self.file, span, false) {
            Ok(()) => Ok(Some(RangeLockGuard { locker: self, span })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(CacheError::Lock {
                first_block: span.first,
                end_block: span.end,
                source,
            }),
        }
    }
}

impl Drop for RangeLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = sys::unlock(&self.locker.file, self.span) {
            tracing::warn!(
                path = %self.locker.path.display(),
                span = %self.span,
                error = %e,
                "Failed to release range lock"
            );
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    use crate::cache::range::BlockSpan;

    #[cfg(target_os = "linux")]
    const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;
    #[cfg(target_os = "linux")]
    const SET_LOCK_WAIT: libc::c_int = libc::F_OFD_SETLKW;
    #[cfg(not(target_os = "linux"))]
    const SET_LOCK: libc::c_int = libc::F_SETLK;
    #[cfg(not(target_os = "linux"))]
    const SET_LOCK_WAIT: libc::c_int = libc::F_SETLKW;

    fn record(span: BlockSpan, lock_type: libc::c_int) -> libc::flock {
        // SAFETY: `flock` is plain old data; all-zero is a valid value and
        // zero `l_pid` is required for open-file-description locks.
        let mut record: libc::flock = unsafe { std::mem::zeroed() };
        record.l_type = lock_type as _;
        record.l_whence = libc::SEEK_SET as _;
        record.l_start = span.first as libc::off_t;
        record.l_len = span.len() as libc::off_t;
        record
    }

    fn set(file: &File, cmd: libc::c_int, mut record: libc::flock) -> io::Result<()> {
        loop {
            // SAFETY: the descriptor is open for the lifetime of `file` and
            // `record` is a valid flock for the duration of the call.
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &mut record as *mut libc::flock) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) => {
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, err))
                }
                _ => return Err(err),
            }
        }
    }

    pub fn lock(file: &File, span: BlockSpan, wait: bool) -> io::Result<()> {
        let cmd = if wait { SET_LOCK_WAIT } else { SET_LOCK };
        set(file, cmd, record(span, libc::F_WRLCK as libc::c_int))
    }

    pub fn unlock(file: &File, span: BlockSpan) -> io::Result<()> {
        set(file, SET_LOCK, record(span, libc::F_UNLCK as libc::c_int))
    }
}

// Without record locks every span maps to the whole file.
#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    use fs2::FileExt;

    use crate::cache::range::BlockSpan;

    pub fn lock(file: &File, _span: BlockSpan, wait: bool) -> io::Result<()> {
        if wait {
            file.lock_exclusive()
        } else {
            file.try_lock_exclusive()
        }
    }

    pub fn unlock(file: &File, _span: BlockSpan) -> io::Result<()> {
        FileExt::unlock(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::blockmap::open_shared_file;
    use tempfile::TempDir;

    fn locker(path: &Path) -> RangeLocker {
        RangeLocker::new(path, open_shared_file(path).unwrap())
    }

    #[test]
    fn test_init_lock_is_reentrant_after_drop() {
        let tmp = TempDir::new().unwrap();
        let file = open_shared_file(&tmp.path().join("idx")).unwrap();

        let first = InitLock::acquire(&file).unwrap();
        drop(first);
        let second = InitLock::acquire(&file).unwrap();
        drop(second);
    }

    #[test]
    fn test_lock_and_release() {
        let tmp = TempDir::new().unwrap();
        let locker = locker(&tmp.path().join("idx"));

        let guard = locker.lock(BlockSpan::new(0, 4)).unwrap();
        drop(guard);
        let again = locker.try_lock(BlockSpan::new(0, 4)).unwrap();
        assert!(again.is_some());
    }

    // A write lock needs a descriptor opened for writing.
    #[cfg(unix)]
    #[test]
    fn test_read_only_descriptor_fails_to_lock() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        drop(open_shared_file(&path).unwrap());
        let locker = RangeLocker::new(&path, File::open(&path).unwrap());

        let err = locker.lock(BlockSpan::new(1, 3)).err().unwrap();
        assert!(matches!(
            err,
            CacheError::Lock {
                first_block: 1,
                end_block: 3,
                ..
            }
        ));
        assert!(matches!(
            locker.try_lock(BlockSpan::new(1, 3)),
            Err(CacheError::Lock { .. })
        ));
    }

    // Classic POSIX locks never conflict within one process, so this only
    // holds for open-file-description locks.
    #[cfg(target_os = "linux")]
    #[test]
    fn test_overlapping_ranges_exclude_each_other() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        let a = locker(&path);
        let b = locker(&path);

        let held = a.lock(BlockSpan::new(2, 6)).unwrap();
        assert!(b.try_lock(BlockSpan::new(5, 8)).unwrap().is_none());
        assert!(b.try_lock(BlockSpan::new(0, 3)).unwrap().is_none());

        // Disjoint ranges proceed in parallel.
        let disjoint = b.try_lock(BlockSpan::new(6, 9)).unwrap();
        assert!(disjoint.is_some());

        drop(held);
        assert!(b.try_lock(BlockSpan::new(2, 6)).unwrap().is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_blocked_locker_waits_for_release() {
        use std::sync::mpsc;
        use std::time::Duration;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        let a = locker(&path);
        let held = a.lock(BlockSpan::new(0, 1)).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            let b = locker(&waiter_path);
            let _guard = b.lock(BlockSpan::new(0, 1)).unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }
}

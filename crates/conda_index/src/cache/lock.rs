//! One writer per subdir cache, enforced with an advisory `flock()` on
//! `<subdir>/.cache/.lock`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};

pub const LOCKFILE_NAME: &str = ".lock";

/// An exclusive lock on a subdir's cache directory.
///
/// Released when dropped, on every exit path.
pub struct CacheLock {
    _flock: Flock<std::fs::File>,
    _lock_path: PathBuf,
}

impl CacheLock {
    /// Acquire the lock without blocking. A second indexer working on the
    /// same subdir gets [`Error::CacheLocked`] immediately.
    pub fn acquire(cache_dir: &Path, subdir: &str) -> Result<Self> {
        fs_err::create_dir_all(cache_dir)?;
        let lock_path = cache_dir.join(LOCKFILE_NAME);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == nix::errno::Errno::EWOULDBLOCK {
                Error::CacheLocked {
                    subdir: subdir.to_string(),
                }
            } else {
                Error::Io(std::io::Error::other(format!("flock failed: {errno}")))
            }
        })?;

        Ok(CacheLock {
            _flock: flock,
            _lock_path: lock_path,
        })
    }
}

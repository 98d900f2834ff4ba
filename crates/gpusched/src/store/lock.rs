use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::common::error::SchedError;

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Exclusive advisory lock shared by every process that touches the store.
///
/// Every acquisition opens its own file description, so two guards can never
/// coexist, not even inside a single process. Nesting acquisitions therefore
/// blocks until the timeout expires.
pub struct StoreLock {
    path: PathBuf,
    timeout: Duration,
}

/// Held lock, released on drop.
pub struct LockGuard {
    _lock: Flock<File>,
}

impl StoreLock {
    pub fn new(path: &Path, timeout: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            timeout,
        }
    }

    /// Polls the lock every 10 ms and blocks the calling thread for at most the configured
    /// timeout. Async callers run on the daemon's current-thread runtime, where the only
    /// other work is the cycle itself, so the stall is bounded by the same timeout.
    pub fn acquire(&self) -> crate::Result<LockGuard> {
        let deadline = Instant::now() + self.timeout;
        let mut file = File::open(&self.path).map_err(|error| {
            SchedError::StoreUnavailable(format!(
                "Cannot open lock file {}: {error}",
                self.path.display()
            ))
        })?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => return Ok(LockGuard { _lock: lock }),
                Err((returned, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EINTR => {
                    if Instant::now() >= deadline {
                        return Err(SchedError::StoreUnavailable(format!(
                            "Lock {} could not be acquired within {}s",
                            self.path.display(),
                            self.timeout.as_secs_f64()
                        )));
                    }
                    file = returned;
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err((_, errno)) => {
                    return Err(SchedError::StoreUnavailable(format!(
                        "Cannot lock {}: {errno}",
                        self.path.display()
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use crate::common::error::SchedError;
    use crate::store::lock::StoreLock;

    fn create_lock(dir: &TempDir, timeout: Duration) -> StoreLock {
        let path = dir.path().join("lock");
        File::create(&path).unwrap();
        StoreLock::new(&path, timeout)
    }

    #[test]
    fn lock_is_exclusive() {
        let dir = TempDir::with_prefix("gpusched").unwrap();
        let lock = create_lock(&dir, Duration::from_millis(50));
        let guard = lock.acquire().unwrap();
        let start = Instant::now();
        assert!(matches!(
            lock.acquire(),
            Err(SchedError::StoreUnavailable(_))
        ));
        assert!(start.elapsed() >= Duration::from_millis(50));
        drop(guard);
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn missing_lock_file_is_unavailable() {
        let dir = TempDir::with_prefix("gpusched").unwrap();
        let lock = StoreLock::new(&dir.path().join("missing"), Duration::from_millis(10));
        assert!(matches!(
            lock.acquire(),
            Err(SchedError::StoreUnavailable(_))
        ));
    }
}

//! Cross-process named mutex.
//!
//! Independent test processes share nothing but the filesystem, so every
//! coordination point (port leases, binary installs) goes through a
//! [`NamedMutex`]. The default backend is [`FileMutex`]: a zero-byte lock file
//! held with `flock(LOCK_EX | LOCK_NB)`. The OS drops the lock when the holder
//! exits, so a crashed test never wedges the next run.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {} is held by another process", .path.display())]
    Contended { path: PathBuf },

    #[error("open lock {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("flock {}: {source}", .path.display())]
    Flock {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("gave up on lock {} after {attempts} attempts", .path.display())]
    Exhausted { path: PathBuf, attempts: u32 },

    #[error("lock acquisition for {} cancelled", .path.display())]
    Cancelled { path: PathBuf },

    #[error("lock task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A mutex identified by a filesystem path, shared by every process that
/// agrees on the path.
#[async_trait]
pub trait NamedMutex: Send + Sync {
    type Guard: Send;

    /// Single non-blocking attempt. Returns [`LockError::Contended`] when the
    /// lock is held elsewhere.
    async fn try_acquire(&self, name: &Path) -> Result<Self::Guard, LockError>;

    async fn release(&self, guard: Self::Guard) -> Result<(), LockError>;
}

/// `flock(2)`-backed [`NamedMutex`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileMutex;

/// A held [`FileMutex`] lock. Dropping it also releases the lock.
pub struct FileLock {
    path: PathBuf,
    lock: Flock<File>,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock")
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl NamedMutex for FileMutex {
    type Guard = FileLock;

    async fn try_acquire(&self, name: &Path) -> Result<FileLock, LockError> {
        let path = name.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = File::options()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|source| LockError::Open {
                    path: path.clone(),
                    source,
                })?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => Ok(FileLock { path, lock }),
                Err((_file, errno)) if errno == Errno::EWOULDBLOCK => {
                    Err(LockError::Contended { path })
                }
                Err((_file, source)) => Err(LockError::Flock { path, source }),
            }
        })
        .await?
    }

    async fn release(&self, guard: FileLock) -> Result<(), LockError> {
        let FileLock { path, lock } = guard;
        lock.unlock()
            .map(drop)
            .map_err(|(_lock, source)| LockError::Flock { path, source })
    }
}

/// Backoff schedule for contended locks.
///
/// Attempt `n` (zero-based) sleeps `min_timeout × factor^n`, multiplied by a
/// random value in `[1, 2)` when `randomize` is set, capped at `max_timeout`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub factor: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub randomize: bool,
}

impl RetryPolicy {
    /// Exactly one attempt.
    pub const fn none() -> Self {
        Self {
            retries: 0,
            factor: 1.0,
            min_timeout: Duration::ZERO,
            max_timeout: Duration::ZERO,
            randomize: false,
        }
    }

    /// Schedule used while waiting for another process to finish installing
    /// the node binary.
    pub const fn install() -> Self {
        Self {
            retries: 100,
            factor: 3.0,
            min_timeout: Duration::from_millis(200),
            max_timeout: Duration::from_secs(2),
            randomize: true,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.randomize {
            rand::thread_rng().gen_range(1.0..2.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.min_timeout.as_secs_f64() * jitter * self.factor.powi(exponent);
        let capped = secs.min(self.max_timeout.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Acquire `name`, retrying contention according to `policy`.
///
/// Only [`LockError::Contended`] is retried; any other failure returns
/// immediately. Cancelling `cancel` aborts between attempts.
pub async fn acquire_with_retry<M>(
    mutex: &M,
    name: &Path,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<M::Guard, LockError>
where
    M: NamedMutex + ?Sized,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled {
                path: name.to_path_buf(),
            });
        }
        match mutex.try_acquire(name).await {
            Ok(guard) => return Ok(guard),
            Err(LockError::Contended { path }) => {
                if attempt >= policy.retries {
                    return Err(LockError::Exhausted {
                        path,
                        attempts: attempt + 1,
                    });
                }
                let delay = policy.delay(attempt);
                attempt += 1;
                debug!(path = %path.display(), attempt, ?delay, "lock contended, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(LockError::Cancelled { path }),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ContendedMutex;
    use super::*;

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            factor: 1.0,
            min_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_millis(10),
            randomize: false,
        }
    }

    #[tokio::test]
    async fn acquire_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let guard = FileMutex.try_acquire(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(guard.path(), path);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn held_lock_reports_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let _guard = FileMutex.try_acquire(&path).await.unwrap();
        let err = FileMutex.try_acquire(&path).await.unwrap_err();
        assert!(matches!(err, LockError::Contended { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn release_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let guard = FileMutex.try_acquire(&path).await.unwrap();
        FileMutex.release(guard).await.unwrap();

        let _again = FileMutex.try_acquire(&path).await.unwrap();
        // The lock file itself is left in place for the next participant.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn invalid_path_returns_open_error() {
        let path = PathBuf::from("/nonexistent/dir/test.lock");
        let err = FileMutex.try_acquire(&path).await.unwrap_err();
        assert!(matches!(err, LockError::Open { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn retry_gives_up_after_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let _held = FileMutex.try_acquire(&path).await.unwrap();

        let err = acquire_with_retry(
            &FileMutex,
            &path,
            &fast_policy(3),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            LockError::Exhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected Exhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn retry_succeeds_once_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let held = FileMutex.try_acquire(&path).await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            FileMutex.release(held).await.unwrap();
        });

        let guard = acquire_with_retry(
            &FileMutex,
            &path,
            &fast_policy(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(guard.path(), path);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let _held = FileMutex.try_acquire(&path).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = acquire_with_retry(&FileMutex, &path, &fast_policy(u32::MAX), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Cancelled { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn retry_outlasts_transient_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let mutex = ContendedMutex::new(3);

        acquire_with_retry(
            &mutex,
            &path,
            &fast_policy(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(mutex.attempts(), 4);
    }

    #[test]
    fn install_delay_grows_then_caps() {
        let policy = RetryPolicy {
            randomize: false,
            ..RetryPolicy::install()
        };
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(1), Duration::from_millis(600));
        assert_eq!(policy.delay(2), Duration::from_millis(1800));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(99), Duration::from_secs(2));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = RetryPolicy::install();
        for attempt in 0..10 {
            let delay = policy.delay(attempt);
            assert!(
                delay >= Duration::from_millis(200),
                "attempt {attempt}: {delay:?}"
            );
            assert!(
                delay <= Duration::from_secs(2),
                "attempt {attempt}: {delay:?}"
            );
        }
    }
}

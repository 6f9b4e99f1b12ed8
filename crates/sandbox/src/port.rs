//! TCP port leases.
//!
//! A lease pairs a port that was bindable at acquisition time with an
//! exclusive lock on `near-sandbox-port-<port>.lock`. The probe listener is
//! closed before the node starts, so the lock is what keeps two sandboxes from
//! racing for the same port.

use std::path::{Path, PathBuf};

use tokio::net::TcpListener;
use tracing::debug;

use crate::lock::{FileLock, FileMutex, LockError, NamedMutex};
use crate::paths::LockPaths;

pub const LOCALHOST: &str = "127.0.0.1";

const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("port {port} is not available: {source}")]
    PortNotAvailable {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("port {port} is locked by another sandbox: {source}")]
    LockFailed {
        port: u16,
        #[source]
        source: LockError,
    },

    #[error("failed to acquire a port:\n{}", .attempts.join("\n"))]
    PortAcquisitionFailed { attempts: Vec<String> },
}

/// A locked port. Hand it back through [`PortAllocator::release`].
#[must_use = "dropping a lease releases the port lock silently"]
#[derive(Debug)]
pub struct PortLease<G = FileLock> {
    port: u16,
    lock_file: PathBuf,
    guard: G,
}

impl<G> PortLease<G> {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn addr(&self) -> String {
        format!("{LOCALHOST}:{}", self.port)
    }
}

pub struct PortAllocator<M: NamedMutex = FileMutex> {
    locks: LockPaths,
    mutex: M,
}

impl PortAllocator<FileMutex> {
    pub fn new(lock_dir: PathBuf) -> Self {
        Self::with_mutex(lock_dir, FileMutex)
    }
}

impl<M: NamedMutex> PortAllocator<M> {
    pub fn with_mutex(lock_dir: PathBuf, mutex: M) -> Self {
        Self {
            locks: LockPaths::new(lock_dir),
            mutex,
        }
    }

    pub fn lock_dir(&self) -> &Path {
        self.locks.dir()
    }

    /// Lease `requested`, or any free port when it is `None` or `Some(0)`.
    ///
    /// A requested port is tried once. An ephemeral port is retried up to ten
    /// times, since another process may lock it between probe and lock.
    pub async fn acquire_or_lock(
        &self,
        requested: Option<u16>,
    ) -> Result<PortLease<M::Guard>, PortError> {
        match requested.filter(|&p| p != 0) {
            Some(port) => self.lease(port).await,
            None => self.lease_ephemeral().await,
        }
    }

    pub async fn release(&self, lease: PortLease<M::Guard>) -> Result<(), PortError> {
        let PortLease { port, guard, .. } = lease;
        self.mutex
            .release(guard)
            .await
            .map_err(|source| PortError::LockFailed { port, source })?;
        debug!(port, "port released");
        Ok(())
    }

    async fn lease(&self, port: u16) -> Result<PortLease<M::Guard>, PortError> {
        let port = probe(port).await?;
        self.lock(port).await
    }

    async fn lease_ephemeral(&self) -> Result<PortLease<M::Guard>, PortError> {
        let mut attempts = Vec::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let result = match probe(0).await {
                Ok(port) => self.lock(port).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(lease) => return Ok(lease),
                Err(e) => {
                    debug!(attempt, error = %e, "ephemeral port attempt failed");
                    attempts.push(format!("Attempt {attempt}: {e}"));
                }
            }
        }
        Err(PortError::PortAcquisitionFailed { attempts })
    }

    async fn lock(&self, port: u16) -> Result<PortLease<M::Guard>, PortError> {
        let lock_file = self.locks.port(port);
        let guard = self
            .mutex
            .try_acquire(&lock_file)
            .await
            .map_err(|source| PortError::LockFailed { port, source })?;
        debug!(port, lock = %lock_file.display(), "port locked");
        Ok(PortLease {
            port,
            lock_file,
            guard,
        })
    }
}

/// Bind and immediately close a listener, returning the bound port.
async fn probe(port: u16) -> Result<u16, PortError> {
    let listener = TcpListener::bind((LOCALHOST, port))
        .await
        .map_err(|source| PortError::PortNotAvailable { port, source })?;
    let bound = listener
        .local_addr()
        .map_err(|source| PortError::PortNotAvailable { port, source })?
        .port();
    drop(listener);
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::testing::ContendedMutex;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn requested_port_is_leased_with_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = PortAllocator::new(dir.path().to_path_buf());
        let port = free_port().await;

        let lease = allocator.acquire_or_lock(Some(port)).await.unwrap();
        assert_eq!(lease.port(), port);
        assert_eq!(
            lease.lock_file(),
            dir.path().join(format!("near-sandbox-port-{port}.lock"))
        );
        assert!(lease.lock_file().exists());
        assert_eq!(lease.addr(), format!("127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn bound_port_is_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = PortAllocator::new(dir.path().to_path_buf());
        let held = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = held.local_addr().unwrap().port();

        let err = allocator.acquire_or_lock(Some(port)).await.unwrap_err();
        assert!(
            matches!(err, PortError::PortNotAvailable { port: p, .. } if p == port),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn locked_port_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let first = PortAllocator::new(dir.path().to_path_buf());
        let second = PortAllocator::new(dir.path().to_path_buf());
        let port = free_port().await;

        let _lease = first.acquire_or_lock(Some(port)).await.unwrap();
        let err = second.acquire_or_lock(Some(port)).await.unwrap_err();
        assert!(
            matches!(
                err,
                PortError::LockFailed {
                    source: LockError::Contended { .. },
                    ..
                }
            ),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn zero_means_any_port() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = PortAllocator::new(dir.path().to_path_buf());
        let lease = allocator.acquire_or_lock(Some(0)).await.unwrap();
        assert_ne!(lease.port(), 0);
    }

    #[tokio::test]
    async fn concurrent_ephemeral_leases_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = PortAllocator::new(dir.path().to_path_buf());

        let (a, b) = tokio::join!(
            allocator.acquire_or_lock(None),
            allocator.acquire_or_lock(None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.port(), b.port());
        assert_ne!(a.lock_file(), b.lock_file());
    }

    #[tokio::test]
    async fn released_port_can_be_locked_again() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = PortAllocator::new(dir.path().to_path_buf());
        let port = free_port().await;

        let lease = allocator.acquire_or_lock(Some(port)).await.unwrap();
        allocator.release(lease).await.unwrap();

        let again = allocator.acquire_or_lock(Some(port)).await.unwrap();
        assert_eq!(again.port(), port);
    }

    #[tokio::test]
    async fn ephemeral_lease_retries_contention() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = ContendedMutex::new(3);
        let allocator = PortAllocator::with_mutex(dir.path().to_path_buf(), mutex.clone());

        let lease = allocator.acquire_or_lock(None).await.unwrap();
        assert_ne!(lease.port(), 0);
        assert_eq!(mutex.attempts(), 4);
    }

    #[tokio::test]
    async fn ephemeral_lease_gives_up_after_ten_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = ContendedMutex::new(u32::MAX);
        let allocator = PortAllocator::with_mutex(dir.path().to_path_buf(), mutex.clone());

        let err = allocator.acquire_or_lock(None).await.unwrap_err();
        match err {
            PortError::PortAcquisitionFailed { attempts } => {
                assert_eq!(attempts.len(), 10);
                assert!(attempts[0].starts_with("Attempt 1: "), "{attempts:?}");
                assert!(attempts[9].starts_with("Attempt 10: "), "{attempts:?}");
            }
            other => panic!("expected PortAcquisitionFailed, got {other}"),
        }
        assert_eq!(mutex.attempts(), 10);
    }

    #[tokio::test]
    async fn requested_port_is_tried_once() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = ContendedMutex::new(1);
        let allocator = PortAllocator::with_mutex(dir.path().to_path_buf(), mutex.clone());
        let port = free_port().await;

        let err = allocator.acquire_or_lock(Some(port)).await.unwrap_err();
        assert!(
            matches!(
                err,
                PortError::LockFailed {
                    source: LockError::Contended { .. },
                    ..
                }
            ),
            "got: {err}"
        );
        assert_eq!(mutex.attempts(), 1);
    }

    #[test]
    fn exhaustion_lists_every_attempt() {
        let err = PortError::PortAcquisitionFailed {
            attempts: vec!["Attempt 1: a".into(), "Attempt 2: b".into()],
        };
        assert_eq!(
            err.to_string(),
            "failed to acquire a port:\nAttempt 1: a\nAttempt 2: b"
        );
    }
}

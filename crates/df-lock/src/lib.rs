//! Cluster-wide named locks for DocFabric background services.
//!
//! Instances contending for the same resource key observe mutual exclusion
//! across the cluster. Acquisition is fair: waiters queue FIFO and only the
//! head of the queue may take the lease. Release is explicit and idempotent;
//! the lease TTL in the backing store is a crash safety net, refreshed by a
//! background heartbeat while the lock is held.

pub mod backend;
pub mod redis_backend;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

pub use backend::{BackendError, CoordinationBackend, MemoryCoordination};
pub use redis_backend::RedisCoordination;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock '{resource}' not acquired after {elapsed_ms}ms")]
    NotAcquired { resource: String, elapsed_ms: u64 },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Debug, Clone)]
pub struct LockProviderConfig {
    /// Lease TTL in the backing store. A heartbeat refreshes it at a third
    /// of this interval while the lock is held.
    pub lease_ttl: Duration,
    /// Delay between acquisition attempts while queued.
    pub poll_interval: Duration,
}

impl Default for LockProviderConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// Acquires named, cluster-wide fair locks with timeout.
pub struct DistributedLockProvider {
    backend: Arc<dyn CoordinationBackend>,
    config: LockProviderConfig,
}

impl DistributedLockProvider {
    pub fn new(backend: Arc<dyn CoordinationBackend>) -> Self {
        Self::with_config(backend, LockProviderConfig::default())
    }

    pub fn with_config(backend: Arc<dyn CoordinationBackend>, config: LockProviderConfig) -> Self {
        Self { backend, config }
    }

    /// Best-effort single attempt, bypassing the waiter queue.
    ///
    /// Equivalent to a zero timeout: never blocks beyond one backend round
    /// trip. A failed attempt yields a non-owning handle whose release is a
    /// no-op.
    pub async fn try_acquire(&self, resource: &str) -> Result<LockHandle> {
        let owner = Uuid::new_v4().to_string();
        let start = Instant::now();

        if self
            .backend
            .try_lock(resource, &owner, self.config.lease_ttl)
            .await?
        {
            Ok(self.held_handle(resource, owner, start.elapsed()))
        } else {
            Ok(LockHandle::not_acquired(resource, start.elapsed()))
        }
    }

    /// Fair acquisition: wait up to `timeout`, granted in FIFO order among
    /// waiters. A zero timeout degenerates to a single attempt.
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockHandle> {
        if timeout.is_zero() {
            return self.try_acquire(resource).await;
        }

        let owner = Uuid::new_v4().to_string();
        let start = Instant::now();

        // The waiter entry expires shortly after our own deadline, so a
        // crashed or cancelled caller cannot stall the queue forever.
        self.backend
            .enqueue_waiter(resource, &owner, timeout + self.config.poll_interval * 4)
            .await?;

        let outcome = self.wait_in_queue(resource, &owner, timeout, start).await;

        // Dequeue on every exit path, including acquisition and errors.
        if let Err(e) = self.backend.remove_waiter(resource, &owner).await {
            warn!(resource = %resource, error = %e, "Failed to remove lock waiter entry");
        }

        match outcome {
            Ok(true) => Ok(self.held_handle(resource, owner, start.elapsed())),
            Ok(false) => Ok(LockHandle::not_acquired(resource, start.elapsed())),
            Err(e) => Err(e),
        }
    }

    /// Throwing variant of [`DistributedLockProvider::acquire`]: a miss is a
    /// typed error carrying the resource name and elapsed time.
    pub async fn acquire_required(&self, resource: &str, timeout: Duration) -> Result<LockHandle> {
        let handle = self.acquire(resource, timeout).await?;
        if handle.acquired() {
            Ok(handle)
        } else {
            Err(LockError::NotAcquired {
                resource: resource.to_string(),
                elapsed_ms: handle.elapsed().as_millis() as u64,
            })
        }
    }

    async fn wait_in_queue(
        &self,
        resource: &str,
        owner: &str,
        timeout: Duration,
        start: Instant,
    ) -> Result<bool> {
        loop {
            // Only the head of the queue may take the lease; everyone else
            // keeps waiting their turn.
            let head = self.backend.first_waiter(resource).await?;
            if head.as_deref() == Some(owner)
                && self
                    .backend
                    .try_lock(resource, owner, self.config.lease_ttl)
                    .await?
            {
                return Ok(true);
            }

            if start.elapsed() >= timeout {
                return Ok(false);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn held_handle(&self, resource: &str, owner: String, elapsed: Duration) -> LockHandle {
        let handle = LockHandle {
            resource: resource.to_string(),
            owner: Some(owner.clone()),
            acquired: true,
            elapsed,
            released: Arc::new(AtomicBool::new(false)),
            backend: Some(self.backend.clone()),
            heartbeat: None,
        };
        debug!(resource = %resource, elapsed_ms = elapsed.as_millis() as u64, "Lock acquired");
        handle.with_heartbeat(self.config.lease_ttl)
    }
}

/// A releasable lease on a named resource.
///
/// Owned exclusively by the caller that acquired it. `release` is idempotent
/// and the only way to relinquish the lock; dropping an unreleased handle
/// spawns a best-effort background release.
pub struct LockHandle {
    resource: String,
    owner: Option<String>,
    acquired: bool,
    elapsed: Duration,
    released: Arc<AtomicBool>,
    backend: Option<Arc<dyn CoordinationBackend>>,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .field("owner", &self.owner)
            .field("acquired", &self.acquired)
            .field("elapsed", &self.elapsed)
            .finish_non_exhaustive()
    }
}

impl LockHandle {
    fn not_acquired(resource: &str, elapsed: Duration) -> Self {
        Self {
            resource: resource.to_string(),
            owner: None,
            acquired: false,
            elapsed,
            released: Arc::new(AtomicBool::new(false)),
            backend: None,
            heartbeat: None,
        }
    }

    fn with_heartbeat(mut self, lease_ttl: Duration) -> Self {
        let (Some(backend), Some(owner)) = (self.backend.clone(), self.owner.clone()) else {
            return self;
        };
        let resource = self.resource.clone();
        let released = self.released.clone();
        let interval = lease_ttl / 3;

        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if released.load(Ordering::SeqCst) {
                    break;
                }
                match backend.refresh(&resource, &owner, lease_ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(resource = %resource, "Lock lease vanished while held");
                        break;
                    }
                    Err(e) => {
                        warn!(resource = %resource, error = %e, "Lock lease refresh failed");
                    }
                }
            }
        }));
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Whether acquisition succeeded before the timeout.
    pub fn acquired(&self) -> bool {
        self.acquired
    }

    /// Time spent attempting acquisition.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }

    /// Release the lease. Idempotent; a no-op on a non-acquired handle.
    pub async fn release(&self) -> Result<()> {
        if !self.acquired || self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = &self.heartbeat {
            task.abort();
        }
        if let (Some(backend), Some(owner)) = (&self.backend, &self.owner) {
            backend.unlock(&self.resource, owner).await?;
            debug!(resource = %self.resource, "Lock released");
        }
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.acquired || self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = &self.heartbeat {
            task.abort();
        }
        if let (Some(backend), Some(owner)) = (self.backend.take(), self.owner.take()) {
            let resource = self.resource.clone();
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    if let Err(e) = backend.unlock(&resource, &owner).await {
                        warn!(resource = %resource, error = %e, "Background lock release failed");
                    }
                });
            } else {
                warn!(resource = %resource, "Lock handle dropped outside a runtime; lease left to TTL expiry");
            }
        }
    }
}

//! Coordination backend boundary.
//!
//! The lock provider only needs four primitives from the backing store:
//! an atomic leased set-if-absent, an owner-checked release, and a waiter
//! queue for FIFO fairness. `MemoryCoordination` implements them process-
//! locally for tests and single-instance deployments; the Redis backend
//! lives in [`crate::redis_backend`].

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("coordination backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Atomically take the lease if nobody holds it. The TTL is a crash
    /// safety net; explicit `unlock` is the release mechanism.
    async fn try_lock(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Release the lease if and only if `owner` still holds it.
    async fn unlock(&self, resource: &str, owner: &str) -> Result<(), BackendError>;

    /// Extend the lease TTL while `owner` holds it. Returns false when the
    /// lease is gone (expired or released elsewhere).
    async fn refresh(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Register a waiter; the entry expires on its own after `patience`
    /// so a crashed or cancelled waiter cannot stall the queue.
    async fn enqueue_waiter(
        &self,
        resource: &str,
        owner: &str,
        patience: Duration,
    ) -> Result<(), BackendError>;

    /// The oldest non-expired waiter, if any.
    async fn first_waiter(&self, resource: &str) -> Result<Option<String>, BackendError>;

    async fn remove_waiter(&self, resource: &str, owner: &str) -> Result<(), BackendError>;
}

#[derive(Default)]
struct ResourceState {
    holder: Option<(String, Instant)>,
    waiters: VecDeque<(String, Instant)>,
}

impl ResourceState {
    fn purge(&mut self, now: Instant) {
        if let Some((_, expires_at)) = &self.holder {
            if *expires_at <= now {
                self.holder = None;
            }
        }
        self.waiters.retain(|(_, deadline)| *deadline > now);
    }
}

/// Process-local coordination backend.
#[derive(Default)]
pub struct MemoryCoordination {
    resources: Mutex<HashMap<String, ResourceState>>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationBackend for MemoryCoordination {
    async fn try_lock(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut resources = self.resources.lock();
        let state = resources.entry(resource.to_string()).or_default();
        state.purge(now);

        if state.holder.is_some() {
            return Ok(false);
        }
        state.holder = Some((owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn unlock(&self, resource: &str, owner: &str) -> Result<(), BackendError> {
        let mut resources = self.resources.lock();
        if let Some(state) = resources.get_mut(resource) {
            if matches!(&state.holder, Some((holder, _)) if holder == owner) {
                state.holder = None;
            }
        }
        Ok(())
    }

    async fn refresh(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut resources = self.resources.lock();
        if let Some(state) = resources.get_mut(resource) {
            state.purge(now);
            if matches!(&state.holder, Some((holder, _)) if holder == owner) {
                state.holder = Some((owner.to_string(), now + ttl));
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn enqueue_waiter(
        &self,
        resource: &str,
        owner: &str,
        patience: Duration,
    ) -> Result<(), BackendError> {
        let mut resources = self.resources.lock();
        let state = resources.entry(resource.to_string()).or_default();
        state
            .waiters
            .push_back((owner.to_string(), Instant::now() + patience));
        Ok(())
    }

    async fn first_waiter(&self, resource: &str) -> Result<Option<String>, BackendError> {
        let now = Instant::now();
        let mut resources = self.resources.lock();
        Ok(resources.get_mut(resource).and_then(|state| {
            state.purge(now);
            state.waiters.front().map(|(owner, _)| owner.clone())
        }))
    }

    async fn remove_waiter(&self, resource: &str, owner: &str) -> Result<(), BackendError> {
        let mut resources = self.resources.lock();
        if let Some(state) = resources.get_mut(resource) {
            state.waiters.retain(|(waiter, _)| waiter != owner);
        }
        Ok(())
    }
}

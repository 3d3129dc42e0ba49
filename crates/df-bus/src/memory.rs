//! In-process broker for tests and single-node deployments.
//!
//! Faithful to real broker semantics where the bus depends on them:
//! at-least-once delivery, per-service queues with fan-out across topic
//! bindings, an unacked set that requeues with the redelivered flag on nack
//! or session loss, and receipt-based ack/nack that is a no-op for receipts
//! the broker no longer tracks.
//!
//! [`MemoryBroker::kill_sessions`] simulates a connection drop so recovery
//! paths can be exercised without a real broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::broker::{BrokerError, BrokerSession, Delivery, MessageBroker};

#[derive(Debug, Clone)]
struct QueuedMessage {
    receipt: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct ServiceQueue {
    pending: Mutex<VecDeque<QueuedMessage>>,
    unacked: Mutex<HashMap<String, Vec<u8>>>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    topics: Mutex<HashSet<String>>,
    /// topic -> services whose queue receives a copy of each publish.
    bindings: Mutex<HashMap<String, HashSet<String>>>,
    queues: Mutex<HashMap<String, Arc<ServiceQueue>>>,
    /// Bumped by [`MemoryBroker::kill_sessions`]; sessions opened under an
    /// older epoch report themselves lost.
    epoch: AtomicU64,
}

impl BrokerState {
    fn queue_for(&self, service: &str) -> Arc<ServiceQueue> {
        self.queues
            .lock()
            .entry(service.to_string())
            .or_default()
            .clone()
    }

    fn bind(&self, topic: &str, service: &str) {
        self.bindings
            .lock()
            .entry(topic.to_string())
            .or_default()
            .insert(service.to_string());
    }

    fn unbind(&self, topic: &str, service: &str) {
        if let Some(services) = self.bindings.lock().get_mut(topic) {
            services.remove(service);
        }
    }
}

#[derive(Default, Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker connection drop: every open session becomes
    /// invalid and every unacked message is requeued as redelivered.
    pub fn kill_sessions(&self) {
        self.state.epoch.fetch_add(1, Ordering::SeqCst);
        let queues: Vec<Arc<ServiceQueue>> =
            self.state.queues.lock().values().cloned().collect();
        for queue in queues {
            let requeued: Vec<(String, Vec<u8>)> = queue.unacked.lock().drain().collect();
            {
                let mut pending = queue.pending.lock();
                for (receipt, body) in requeued {
                    pending.push_front(QueuedMessage {
                        receipt,
                        body,
                        redelivered: true,
                    });
                }
            }
            queue.notify.notify_waiters();
        }
    }

    /// Messages sitting in `service`'s queue, pending plus unacked.
    pub fn depth(&self, service: &str) -> usize {
        let queue = self.state.queue_for(service);
        let depth = queue.pending.lock().len() + queue.unacked.lock().len();
        depth
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare_topic(&self, topic: &str) -> Result<(), BrokerError> {
        self.state.topics.lock().insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let services: Vec<String> = self
            .state
            .bindings
            .lock()
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        for service in services {
            let queue = self.state.queue_for(&service);
            queue.pending.lock().push_back(QueuedMessage {
                receipt: Uuid::new_v4().to_string(),
                body: body.clone(),
                redelivered: false,
            });
            queue.notify.notify_waiters();
        }
        Ok(())
    }

    async fn open_session(
        &self,
        service: &str,
        topics: &[String],
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        for topic in topics {
            self.state.bind(topic, service);
        }
        Ok(Arc::new(MemorySession {
            service: service.to_string(),
            epoch: self.state.epoch.load(Ordering::SeqCst),
            queue: self.state.queue_for(service),
            state: self.state.clone(),
        }))
    }
}

struct MemorySession {
    service: String,
    epoch: u64,
    queue: Arc<ServiceQueue>,
    state: Arc<BrokerState>,
}

impl MemorySession {
    fn is_lost(&self) -> bool {
        self.state.epoch.load(Ordering::SeqCst) != self.epoch
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn bind(&self, topic: &str) -> Result<(), BrokerError> {
        if self.is_lost() {
            return Err(BrokerError::SessionLost);
        }
        self.state.bind(topic, &self.service);
        Ok(())
    }

    async fn unbind(&self, topic: &str) -> Result<(), BrokerError> {
        if self.is_lost() {
            return Err(BrokerError::SessionLost);
        }
        self.state.unbind(topic, &self.service);
        Ok(())
    }

    async fn next_delivery(&self) -> Result<Delivery, BrokerError> {
        loop {
            if self.is_lost() {
                return Err(BrokerError::SessionLost);
            }

            let next = self.queue.pending.lock().pop_front();
            if let Some(message) = next {
                self.queue
                    .unacked
                    .lock()
                    .insert(message.receipt.clone(), message.body.clone());
                return Ok(Delivery {
                    body: message.body,
                    redelivered: message.redelivered,
                    receipt: message.receipt,
                });
            }

            // Bounded wait so a lost session is noticed even without
            // traffic.
            tokio::select! {
                _ = self.queue.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), BrokerError> {
        // An ack for a receipt the broker already requeued is dropped, the
        // requeued copy will be delivered again. That is the at-least-once
        // contract.
        self.queue.unacked.lock().remove(receipt);
        Ok(())
    }

    async fn nack(&self, receipt: &str) -> Result<(), BrokerError> {
        let body = self.queue.unacked.lock().remove(receipt);
        if let Some(body) = body {
            self.queue.pending.lock().push_front(QueuedMessage {
                receipt: receipt.to_string(),
                body,
                redelivered: true,
            });
            self.queue.notify.notify_waiters();
        }
        Ok(())
    }
}

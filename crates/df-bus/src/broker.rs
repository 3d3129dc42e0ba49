//! Transport seam between the event bus and a message broker.
//!
//! The bus only needs four things from a broker: topic declaration,
//! publishing, a consuming session, and explicit ack/nack with a receipt.
//! Everything delivery-semantic (redelivery flags, at-least-once) is the
//! broker's job; everything event-semantic (envelopes, handlers, admission)
//! stays above this seam.

use std::sync::Arc;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker is unreachable or refused the operation; retrying later
    /// may succeed.
    #[error("broker transient error: {0}")]
    Transient(String),

    /// The consuming session died. Unacknowledged deliveries will be
    /// re-presented on a new session with the redelivered flag set.
    #[error("broker session lost")]
    SessionLost,
}

/// One message presented for consumption.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    /// Set by the broker when this message was already presented once and
    /// not acknowledged.
    pub redelivered: bool,
    /// Opaque handle for ack/nack. Valid only within the session that
    /// produced the delivery.
    pub receipt: String,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Idempotently create a topic. Safe to call on every subscribe.
    async fn declare_topic(&self, topic: &str) -> Result<(), BrokerError>;

    /// Publish one message to every service bound to `topic`.
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Open a consuming session for `service`, bound to `topics`.
    async fn open_session(
        &self,
        service: &str,
        topics: &[String],
    ) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// A consuming session. Deliveries must be acked or nacked; dropping the
/// session without acking counts as a nack on everything outstanding.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn bind(&self, topic: &str) -> Result<(), BrokerError>;

    async fn unbind(&self, topic: &str) -> Result<(), BrokerError>;

    /// Wait for the next delivery. Returns [`BrokerError::SessionLost`]
    /// when the session is no longer valid and must be reopened.
    async fn next_delivery(&self) -> Result<Delivery, BrokerError>;

    /// Acknowledge: the broker forgets the message.
    async fn ack(&self, receipt: &str) -> Result<(), BrokerError>;

    /// Negative-acknowledge: the broker requeues the message and will
    /// re-present it with the redelivered flag set.
    async fn nack(&self, receipt: &str) -> Result<(), BrokerError>;
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod retry;

pub use retry::{RetryInvoker, RetryPolicy};

// ============================================================================
// Integration Events
// ============================================================================

/// A typed integration event that can be carried on the bus.
///
/// The type tag is fixed at compile time and doubles as the routing key for
/// subscriptions, so handler resolution never goes through runtime type
/// lookup by name.
pub trait IntegrationEvent: Serialize + serde::de::DeserializeOwned + Send + Sync {
    const EVENT_TYPE: &'static str;
}

/// The immutable unit of work carried on the bus.
///
/// An envelope is created once by a producer and never mutated after
/// publishing. The `redelivered` flag is the only field owned by the bus
/// layer: it is overwritten from the broker's delivery flag on every
/// delivery attempt, so handlers always see whether the broker is
/// re-presenting a previously unacknowledged message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub event_type: String,
    pub tenant_id: i64,
    /// Acting principal, carried as a claim so consumers can re-authenticate
    /// without any session state.
    pub created_by: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub redelivered: bool,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Wrap a typed event for publishing on behalf of `created_by` in
    /// `tenant_id`'s scope.
    pub fn for_event<E: IntegrationEvent>(
        tenant_id: i64,
        created_by: impl Into<String>,
        event: &E,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: E::EVENT_TYPE.to_string(),
            tenant_id,
            created_by: created_by.into(),
            occurred_at: Utc::now(),
            redelivered: false,
            payload: serde_json::to_value(event)?,
        })
    }

    /// Deserialize the payload into the handler's expected event type.
    pub fn decode<E: IntegrationEvent>(&self) -> Result<E, EnvelopeError> {
        if self.event_type != E::EVENT_TYPE {
            return Err(EnvelopeError::TypeMismatch {
                expected: E::EVENT_TYPE,
                actual: self.event_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("event type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },
}

// ============================================================================
// Dispatch Jobs
// ============================================================================

/// A unit queued inside a worker dispatch queue.
///
/// Consumed by exactly one worker slot at a time; removed from the queue on
/// success or permanent failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJob {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchJob {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            attempt_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.enqueued_at).num_seconds()
    }
}

//! Integration event bus for DocFabric services.
//!
//! Producers wrap typed events in an [`EventEnvelope`] and publish them;
//! consumer services subscribe typed handlers and get at-least-once
//! delivery with tenant scope and principal re-established per attempt.
//! The broker behind the bus is pluggable: [`memory::MemoryBroker`] in
//! process, AMQP behind the `amqp` feature.

pub mod broker;
pub mod bus;
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use broker::{BrokerError, BrokerSession, Delivery, MessageBroker};
pub use bus::{BusError, EventBus, EventBusConfig, EventHandler, HandlerOutcome};
pub use df_common::{EventEnvelope, IntegrationEvent};
pub use memory::MemoryBroker;

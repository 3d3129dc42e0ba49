//! The event bus: typed subscription registry, publish path, and the
//! consume loop that turns broker deliveries into handler invocations.
//!
//! Delivery contract: a message is acked only when every handler reached a
//! terminal outcome (completed, or failed permanently and logged for
//! operator replay). Any transient failure or busy rejection leaves the
//! message unacknowledged so the broker re-presents it with the
//! redelivered flag set. Handlers therefore must be idempotent.

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use df_common::{EventEnvelope, IntegrationEvent, RetryInvoker, RetryPolicy};
use df_context::HandlerScaffold;
use df_dispatch::{AdmissionController, AdmissionPermit, AdmissionPolicy};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::{BrokerError, BrokerSession, Delivery, MessageBroker};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("publish failed after retries: {0}")]
    PublishFailed(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Envelope(#[from] df_common::EnvelopeError),
}

/// Terminal verdict of one handler invocation.
pub enum HandlerOutcome {
    Completed,
    /// The instance is at its admission ceiling. The message must come
    /// back later.
    RejectedBusy,
    /// Something recoverable failed; redelivery should retry.
    Transient(anyhow::Error),
    /// Retrying can never succeed. The delivery is consumed and the
    /// failure logged for operator replay.
    Permanent(anyhow::Error),
}

/// A subscriber to one event type.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Whether deliveries to this handler pass through the admission gate.
    fn admission(&self) -> AdmissionPolicy {
        AdmissionPolicy::Exempt
    }

    async fn handle(
        &self,
        scope: &df_context::EstablishedScope,
        envelope: &EventEnvelope,
    ) -> HandlerOutcome;
}

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Attempts and spacing for the publish path.
    pub publish_retry: RetryPolicy,
    /// Hard cap on one publish attempt.
    pub publish_timeout: Duration,
    /// Pause before reopening a lost consumer session.
    pub reconnect_delay: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            publish_retry: RetryPolicy::backoff(3, Duration::from_millis(200)),
            publish_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

struct BusState {
    config: EventBusConfig,
    broker: Arc<dyn MessageBroker>,
    scaffold: HandlerScaffold,
    admission: AdmissionController,
    /// event type -> registered handlers, keyed by handler type for
    /// unsubscribe.
    handlers: DashMap<String, Vec<(TypeId, Arc<dyn EventHandler>)>>,
    session: tokio::sync::Mutex<Option<Arc<dyn BrokerSession>>>,
    consumer_started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

#[derive(Clone)]
pub struct EventBus {
    state: Arc<BusState>,
}

impl EventBus {
    pub fn new(
        config: EventBusConfig,
        broker: Arc<dyn MessageBroker>,
        scaffold: HandlerScaffold,
        admission: AdmissionController,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            state: Arc::new(BusState {
                config,
                broker,
                scaffold,
                admission,
                handlers: DashMap::new(),
                session: tokio::sync::Mutex::new(None),
                consumer_started: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Register `handler` for `E`. The first subscription opens the
    /// consumer session and starts the consume loop; later ones bind the
    /// live session to the new topic.
    pub async fn subscribe<E, H>(&self, handler: Arc<H>) -> Result<(), BusError>
    where
        E: IntegrationEvent + 'static,
        H: EventHandler + 'static,
    {
        let topic = E::EVENT_TYPE;
        self.state.broker.declare_topic(topic).await?;

        info!(event_type = topic, handler = handler.name(), "Handler subscribed");
        self.state
            .handlers
            .entry(topic.to_string())
            .or_default()
            .push((TypeId::of::<H>(), handler));

        // The topic must be bound before this call returns, so an event
        // published immediately after subscribing already has somewhere to
        // land. The slot lock also keeps a concurrent reconnect from
        // opening a session that misses this topic.
        {
            let mut slot = self.state.session.lock().await;
            match slot.as_ref() {
                Some(session) => session.bind(topic).await?,
                None => {
                    let session = self
                        .state
                        .broker
                        .open_session(self.state.scaffold.service(), &[topic.to_string()])
                        .await?;
                    *slot = Some(session);
                }
            }
        }

        if !self.state.consumer_started.swap(true, Ordering::SeqCst) {
            let state = self.state.clone();
            tokio::spawn(async move { consume_loop(state).await });
        }
        Ok(())
    }

    /// Remove `H`'s subscription to `E`. When no handler for the event
    /// type remains, the topic is unbound and its deliveries stop.
    pub async fn unsubscribe<E, H>(&self) -> Result<(), BusError>
    where
        E: IntegrationEvent + 'static,
        H: EventHandler + 'static,
    {
        let topic = E::EVENT_TYPE;
        let now_empty = {
            let mut removed = false;
            if let Some(mut entry) = self.state.handlers.get_mut(topic) {
                entry.retain(|(id, _)| {
                    let keep = *id != TypeId::of::<H>();
                    removed |= !keep;
                    keep
                });
            }
            if removed {
                info!(event_type = topic, "Handler unsubscribed");
            }
            self.state
                .handlers
                .get(topic)
                .map(|e| e.is_empty())
                .unwrap_or(false)
        };

        if now_empty {
            self.state.handlers.remove(topic);
            let session = self.state.session.lock().await;
            if let Some(session) = session.as_ref() {
                session.unbind(topic).await?;
            }
        }
        Ok(())
    }

    /// Publish an envelope to its event-type topic, retrying transient
    /// broker failures. The envelope is serialized once; the bytes on the
    /// wire are immutable from here on.
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        let bytes = envelope.to_bytes()?;
        let topic = envelope.event_type.clone();
        let broker = self.state.broker.clone();
        let timeout = self.state.config.publish_timeout;

        let event_id = envelope.id;
        let published = RetryInvoker::run_with(
            self.state.config.publish_retry,
            || {
                let broker = broker.clone();
                let topic = topic.clone();
                let bytes = bytes.clone();
                async move {
                    match tokio::time::timeout(timeout, broker.publish(&topic, bytes)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("publish timed out after {timeout:?}")),
                    }
                }
            },
            |attempt, reason| {
                warn!(event_id = %event_id, attempt = attempt, reason = %reason, "Publish attempt failed");
            },
            |reason| {
                error!(event_id = %event_id, reason = %reason, "Publish failed after exhausting retries");
            },
        )
        .await;

        match published {
            Some(()) => {
                debug!(event_id = %event_id, event_type = %topic, "Event published");
                Ok(())
            }
            None => Err(BusError::PublishFailed(topic)),
        }
    }

    /// Instance-local load snapshot.
    pub fn admission(&self) -> &AdmissionController {
        &self.state.admission
    }

    /// Stop the consume loop. In-flight deliveries finish; nothing new is
    /// pulled.
    pub fn shutdown(&self) {
        let _ = self.state.shutdown_tx.send(());
    }
}

/// Pull deliveries until shutdown, reopening the session when the broker
/// drops it. Unacked messages from a dead session come back redelivered.
///
/// The first session is opened by `subscribe` before it returns; this loop
/// only reopens after a loss. Each delivery runs on its own task, so one
/// slow handler never head-of-line-blocks the rest of the queue.
async fn consume_loop(state: Arc<BusState>) {
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let service = state.scaffold.service().to_string();

    loop {
        let session = {
            let mut slot = state.session.lock().await;
            match slot.as_ref() {
                Some(session) => session.clone(),
                None => {
                    let topics: Vec<String> =
                        state.handlers.iter().map(|e| e.key().clone()).collect();
                    match state.broker.open_session(&service, &topics).await {
                        Ok(session) => {
                            info!(service = %service, topics = topics.len(), "Consumer session reopened");
                            *slot = Some(session.clone());
                            session
                        }
                        Err(e) => {
                            drop(slot);
                            warn!(error = %e, "Failed to open consumer session, retrying");
                            tokio::select! {
                                _ = tokio::time::sleep(state.config.reconnect_delay) => continue,
                                _ = shutdown_rx.recv() => break,
                            }
                        }
                    }
                }
            }
        };

        loop {
            let delivery = tokio::select! {
                d = session.next_delivery() => d,
                _ = shutdown_rx.recv() => {
                    info!("Event bus consumer stopping");
                    return;
                }
            };

            match delivery {
                Ok(delivery) => {
                    let state = state.clone();
                    let session = session.clone();
                    tokio::spawn(async move {
                        dispatch_delivery(&state, session.as_ref(), delivery).await;
                    });
                }
                Err(BrokerError::SessionLost) => {
                    warn!("Consumer session lost, reopening");
                    break;
                }
                Err(BrokerError::Transient(reason)) => {
                    warn!(reason = %reason, "Transient consume error");
                    tokio::time::sleep(state.config.reconnect_delay).await;
                }
            }
        }

        state.session.lock().await.take();
    }
}

/// Route one delivery through admission, scope establishment, and every
/// registered handler, then ack or nack.
async fn dispatch_delivery(state: &Arc<BusState>, session: &dyn BrokerSession, delivery: Delivery) {
    let mut envelope = match EventEnvelope::from_bytes(&delivery.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            // Poison message: redelivery can never fix a codec error.
            error!(error = %e, "Discarding undecodable message");
            ack_or_log(session, &delivery.receipt).await;
            return;
        }
    };
    // The broker's flag is authoritative, whatever the producer serialized.
    envelope.redelivered = delivery.redelivered;

    let handlers: Vec<Arc<dyn EventHandler>> = state
        .handlers
        .get(&envelope.event_type)
        .map(|e| e.iter().map(|(_, h)| h.clone()).collect())
        .unwrap_or_default();

    if handlers.is_empty() {
        warn!(event_type = %envelope.event_type, event_id = %envelope.id, "No handler registered, discarding");
        ack_or_log(session, &delivery.receipt).await;
        return;
    }

    // Admission is consulted once per delivery, before any side effect, and
    // only when a gated handler is subscribed. A redelivered message is
    // never re-rejected for busyness: it already consumed a rejection once
    // and must make forward progress.
    let gated = handlers
        .iter()
        .any(|h| h.admission() == AdmissionPolicy::Gated);
    let _permit: Option<AdmissionPermit> = if gated {
        if envelope.redelivered {
            Some(state.admission.begin_forced())
        } else {
            match state.admission.begin() {
                Ok(permit) => Some(permit),
                Err(decision) => {
                    warn!(
                        event_id = %envelope.id,
                        in_flight = decision.in_flight,
                        ceiling = decision.ceiling,
                        "Too busy, deferring delivery"
                    );
                    nack_or_log(session, &delivery.receipt).await;
                    return;
                }
            }
        }
    } else {
        None
    };

    let scope = match state.scaffold.establish(&envelope).await {
        Ok(scope) => scope,
        Err(e) => {
            error!(event_id = %envelope.id, error = %e, "Could not establish delivery scope");
            nack_or_log(session, &delivery.receipt).await;
            return;
        }
    };

    let mut retry_needed = false;
    for handler in &handlers {
        let outcome = handler
            .handle(&scope, &envelope)
            .instrument(scope.span.clone())
            .await;
        match outcome {
            HandlerOutcome::Completed => {
                debug!(event_id = %envelope.id, handler = handler.name(), "Handler completed");
            }
            HandlerOutcome::RejectedBusy => {
                warn!(event_id = %envelope.id, handler = handler.name(), "Handler rejected for load");
                retry_needed = true;
            }
            HandlerOutcome::Transient(e) => {
                warn!(event_id = %envelope.id, handler = handler.name(), error = %e, "Transient handler failure");
                retry_needed = true;
            }
            HandlerOutcome::Permanent(e) => {
                // Consumed but failed. Logged with full identity so an
                // operator can replay it.
                error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    tenant_id = envelope.tenant_id,
                    handler = handler.name(),
                    error = %e,
                    "Permanent handler failure, discarding delivery"
                );
            }
        }
    }

    if retry_needed {
        nack_or_log(session, &delivery.receipt).await;
    } else {
        ack_or_log(session, &delivery.receipt).await;
    }
}

async fn ack_or_log(session: &dyn BrokerSession, receipt: &str) {
    if let Err(e) = session.ack(receipt).await {
        warn!(error = %e, "Ack failed, delivery will repeat");
    }
}

async fn nack_or_log(session: &dyn BrokerSession, receipt: &str) {
    if let Err(e) = session.nack(receipt).await {
        warn!(error = %e, "Nack failed, broker will time the delivery out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use df_context::{EstablishedScope, StaticIdentity};
    use parking_lot::Mutex as PlMutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct DocumentSaved {
        document_id: String,
    }

    impl IntegrationEvent for DocumentSaved {
        const EVENT_TYPE: &'static str = "document.saved";
    }

    /// Records every delivery it sees; scripted to fail the first N
    /// attempts transiently.
    struct RecordingHandler {
        policy: AdmissionPolicy,
        fail_first: std::sync::atomic::AtomicUsize,
        seen: PlMutex<Vec<(String, bool, i64)>>,
    }

    impl RecordingHandler {
        fn new(policy: AdmissionPolicy) -> Arc<Self> {
            Arc::new(Self {
                policy,
                fail_first: std::sync::atomic::AtomicUsize::new(0),
                seen: PlMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl EventHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }

        fn admission(&self) -> AdmissionPolicy {
            self.policy
        }

        async fn handle(
            &self,
            scope: &EstablishedScope,
            envelope: &EventEnvelope,
        ) -> HandlerOutcome {
            self.seen.lock().push((
                envelope.event_type.clone(),
                envelope.redelivered,
                scope.tenant.tenant_id,
            ));
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return HandlerOutcome::Transient(anyhow::anyhow!("induced"));
            }
            HandlerOutcome::Completed
        }
    }

    fn test_bus(broker: &MemoryBroker, ceiling: usize) -> EventBus {
        let identity = Arc::new(StaticIdentity::new());
        identity.add_tenant(7, "acme").add_principal(7, "user-1");
        EventBus::new(
            EventBusConfig {
                publish_retry: RetryPolicy::fixed(2, Duration::ZERO),
                publish_timeout: Duration::from_secs(1),
                reconnect_delay: Duration::from_millis(10),
            },
            Arc::new(broker.clone()),
            HandlerScaffold::new("test-svc", identity.clone(), identity),
            AdmissionController::new(ceiling),
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn delivers_published_event_with_established_scope() {
        let broker = MemoryBroker::new();
        let bus = test_bus(&broker, 4);
        let handler = RecordingHandler::new(AdmissionPolicy::Exempt);
        bus.subscribe::<DocumentSaved, _>(handler.clone())
            .await
            .unwrap();

        let envelope = EventEnvelope::for_event(
            7,
            "user-1",
            &DocumentSaved {
                document_id: "d1".into(),
            },
        )
        .unwrap();
        bus.publish(&envelope).await.unwrap();

        wait_for(|| !handler.seen.lock().is_empty()).await;
        let seen = handler.seen.lock().clone();
        assert_eq!(seen, vec![("document.saved".to_string(), false, 7)]);
        bus.shutdown();
    }

    #[tokio::test]
    async fn burst_published_immediately_after_subscribe_is_fully_delivered() {
        let broker = MemoryBroker::new();
        let bus = test_bus(&broker, 4);
        let handler = RecordingHandler::new(AdmissionPolicy::Exempt);
        bus.subscribe::<DocumentSaved, _>(handler.clone())
            .await
            .unwrap();

        // No settling delay: the binding must exist the moment subscribe
        // returns, or these land nowhere.
        for i in 0..5 {
            let envelope = EventEnvelope::for_event(
                7,
                "user-1",
                &DocumentSaved {
                    document_id: format!("burst-{i}"),
                },
            )
            .unwrap();
            bus.publish(&envelope).await.unwrap();
        }

        wait_for(|| handler.seen.lock().len() == 5).await;
        bus.shutdown();
    }

    #[tokio::test]
    async fn deliveries_run_on_independent_tasks() {
        struct SlowHandler {
            current: std::sync::atomic::AtomicUsize,
            peak: std::sync::atomic::AtomicUsize,
            done: std::sync::atomic::AtomicUsize,
        }

        #[async_trait::async_trait]
        impl EventHandler for SlowHandler {
            fn name(&self) -> &str {
                "slow"
            }

            async fn handle(
                &self,
                _scope: &EstablishedScope,
                _envelope: &EventEnvelope,
            ) -> HandlerOutcome {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                self.done.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::Completed
            }
        }

        let broker = MemoryBroker::new();
        let bus = test_bus(&broker, 8);
        let handler = Arc::new(SlowHandler {
            current: std::sync::atomic::AtomicUsize::new(0),
            peak: std::sync::atomic::AtomicUsize::new(0),
            done: std::sync::atomic::AtomicUsize::new(0),
        });
        bus.subscribe::<DocumentSaved, _>(handler.clone())
            .await
            .unwrap();

        for i in 0..4 {
            let envelope = EventEnvelope::for_event(
                7,
                "user-1",
                &DocumentSaved {
                    document_id: format!("slow-{i}"),
                },
            )
            .unwrap();
            bus.publish(&envelope).await.unwrap();
        }

        wait_for(|| handler.done.load(Ordering::SeqCst) == 4).await;
        // Deliveries overlap when each runs on its own task.
        assert!(
            handler.peak.load(Ordering::SeqCst) >= 2,
            "deliveries were processed sequentially"
        );
        bus.shutdown();
    }

    #[tokio::test]
    async fn transient_failure_is_redelivered_with_flag_set() {
        let broker = MemoryBroker::new();
        let bus = test_bus(&broker, 4);
        let handler = RecordingHandler::new(AdmissionPolicy::Exempt);
        handler.fail_first.store(1, Ordering::SeqCst);
        bus.subscribe::<DocumentSaved, _>(handler.clone())
            .await
            .unwrap();

        let envelope = EventEnvelope::for_event(
            7,
            "user-1",
            &DocumentSaved {
                document_id: "d2".into(),
            },
        )
        .unwrap();
        bus.publish(&envelope).await.unwrap();

        wait_for(|| handler.seen.lock().len() >= 2).await;
        let flags: Vec<bool> = handler.seen.lock().iter().map(|(_, r, _)| *r).collect();
        assert_eq!(flags, vec![false, true]);
        bus.shutdown();
    }

    #[tokio::test]
    async fn busy_instance_defers_then_forces_redelivery_through() {
        let broker = MemoryBroker::new();
        let bus = test_bus(&broker, 1);
        let handler = RecordingHandler::new(AdmissionPolicy::Gated);
        bus.subscribe::<DocumentSaved, _>(handler.clone())
            .await
            .unwrap();

        // Saturate the gate before the delivery arrives.
        let slot = bus.admission().begin_forced();

        let envelope = EventEnvelope::for_event(
            7,
            "user-1",
            &DocumentSaved {
                document_id: "d3".into(),
            },
        )
        .unwrap();
        bus.publish(&envelope).await.unwrap();

        // First presentation is rejected before the handler runs; the
        // redelivered copy is admitted despite the busy gate.
        wait_for(|| !handler.seen.lock().is_empty()).await;
        let seen = handler.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].1, "redelivered copy should carry the flag");
        drop(slot);
        bus.shutdown();
    }

    #[tokio::test]
    async fn unknown_event_type_is_discarded_not_redelivered() {
        let broker = MemoryBroker::new();
        let bus = test_bus(&broker, 4);
        let handler = RecordingHandler::new(AdmissionPolicy::Exempt);
        bus.subscribe::<DocumentSaved, _>(handler.clone())
            .await
            .unwrap();

        // An envelope whose type has no handler, pushed straight onto the
        // topic this service consumes.
        let mut envelope = EventEnvelope::for_event(
            7,
            "user-1",
            &DocumentSaved {
                document_id: "d4".into(),
            },
        )
        .unwrap();
        envelope.event_type = "document.unknown".to_string();
        broker
            .publish("document.saved", envelope.to_bytes().unwrap())
            .await
            .unwrap();

        wait_for(|| broker.depth("test-svc") == 0).await;
        assert!(handler.seen.lock().is_empty());
        bus.shutdown();
    }

    #[tokio::test]
    async fn undecodable_message_is_discarded() {
        let broker = MemoryBroker::new();
        let bus = test_bus(&broker, 4);
        let handler = RecordingHandler::new(AdmissionPolicy::Exempt);
        bus.subscribe::<DocumentSaved, _>(handler.clone())
            .await
            .unwrap();

        broker
            .publish("document.saved", b"not json".to_vec())
            .await
            .unwrap();

        wait_for(|| broker.depth("test-svc") == 0).await;
        assert!(handler.seen.lock().is_empty());
        bus.shutdown();
    }

    #[tokio::test]
    async fn session_loss_recovers_and_redelivers_unacked() {
        let broker = MemoryBroker::new();
        let bus = test_bus(&broker, 4);

        /// Parks on first delivery until released, so the message is
        /// in-flight (unacked) when the session dies.
        struct ParkingHandler {
            release: tokio::sync::Notify,
            seen: PlMutex<Vec<bool>>,
        }

        #[async_trait::async_trait]
        impl EventHandler for ParkingHandler {
            fn name(&self) -> &str {
                "parking"
            }

            async fn handle(
                &self,
                _scope: &EstablishedScope,
                envelope: &EventEnvelope,
            ) -> HandlerOutcome {
                self.seen.lock().push(envelope.redelivered);
                if !envelope.redelivered {
                    self.release.notified().await;
                    return HandlerOutcome::Transient(anyhow::anyhow!("session died under us"));
                }
                HandlerOutcome::Completed
            }
        }

        let handler = Arc::new(ParkingHandler {
            release: tokio::sync::Notify::new(),
            seen: PlMutex::new(Vec::new()),
        });
        bus.subscribe::<DocumentSaved, _>(handler.clone())
            .await
            .unwrap();

        let envelope = EventEnvelope::for_event(
            7,
            "user-1",
            &DocumentSaved {
                document_id: "d5".into(),
            },
        )
        .unwrap();
        bus.publish(&envelope).await.unwrap();

        wait_for(|| !handler.seen.lock().is_empty()).await;
        broker.kill_sessions();
        handler.release.notify_one();

        wait_for(|| handler.seen.lock().len() >= 2).await;
        let seen = handler.seen.lock().clone();
        assert_eq!(seen, vec![false, true]);
        bus.shutdown();
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let bus = test_bus(&broker, 4);
        let handler = RecordingHandler::new(AdmissionPolicy::Exempt);
        bus.subscribe::<DocumentSaved, _>(handler.clone())
            .await
            .unwrap();
        bus.unsubscribe::<DocumentSaved, RecordingHandler>()
            .await
            .unwrap();

        let envelope = EventEnvelope::for_event(
            7,
            "user-1",
            &DocumentSaved {
                document_id: "d6".into(),
            },
        )
        .unwrap();
        bus.publish(&envelope).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handler.seen.lock().is_empty());
        bus.shutdown();
    }
}

//! AMQP broker backend (RabbitMQ via lapin).
//!
//! Topology: one durable direct exchange for all integration events, one
//! durable queue per consuming service, bound once per subscribed event
//! type with the event type as routing key. Ack/nack map straight onto
//! basic.ack and basic.nack with requeue, which is where the redelivered
//! flag comes from.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tracing::{info, warn};

use crate::broker::{BrokerError, BrokerSession, Delivery, MessageBroker};

const EVENTS_EXCHANGE: &str = "df.events";
const PERSISTENT: u8 = 2;

fn transient(e: lapin::Error) -> BrokerError {
    BrokerError::Transient(e.to_string())
}

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    /// Unacked deliveries the broker may have outstanding per session.
    pub prefetch: u16,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            prefetch: 16,
        }
    }
}

pub struct AmqpBroker {
    config: AmqpConfig,
    connection: Connection,
    publish_channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(config: AmqpConfig) -> Result<Self, BrokerError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(transient)?;
        let publish_channel = connection.create_channel().await.map_err(transient)?;
        declare_exchange(&publish_channel).await?;
        info!(url = %config.url, "Connected to AMQP broker");
        Ok(Self {
            config,
            connection,
            publish_channel,
        })
    }
}

async fn declare_exchange(channel: &Channel) -> Result<(), BrokerError> {
    channel
        .exchange_declare(
            EVENTS_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(transient)
}

fn queue_name(service: &str) -> String {
    format!("df.{service}")
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn declare_topic(&self, _topic: &str) -> Result<(), BrokerError> {
        // Routing keys on a direct exchange need no per-topic declaration;
        // the exchange itself is declared at connect time.
        Ok(())
    }

    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.publish_channel
            .basic_publish(
                EVENTS_EXCHANGE,
                topic,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(transient)?
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn open_session(
        &self,
        service: &str,
        topics: &[String],
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let channel = self.connection.create_channel().await.map_err(transient)?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(transient)?;
        declare_exchange(&channel).await?;

        let queue = queue_name(service);
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transient)?;

        let session = AmqpSession {
            channel: channel.clone(),
            queue,
            consumer: tokio::sync::Mutex::new(None),
        };
        for topic in topics {
            session.bind(topic).await?;
        }
        Ok(Arc::new(session))
    }
}

struct AmqpSession {
    channel: Channel,
    queue: String,
    /// Started lazily on the first `next_delivery`, so sessions opened only
    /// for publishing never register a consumer.
    consumer: tokio::sync::Mutex<Option<Consumer>>,
}

impl AmqpSession {
    fn parse_receipt(receipt: &str) -> Result<u64, BrokerError> {
        receipt
            .parse::<u64>()
            .map_err(|_| BrokerError::Transient(format!("malformed receipt '{receipt}'")))
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn bind(&self, topic: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &self.queue,
                EVENTS_EXCHANGE,
                topic,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transient)
    }

    async fn unbind(&self, topic: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_unbind(&self.queue, EVENTS_EXCHANGE, topic, FieldTable::default())
            .await
            .map_err(transient)
    }

    async fn next_delivery(&self) -> Result<Delivery, BrokerError> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_none() {
            let started = self
                .channel
                .basic_consume(
                    &self.queue,
                    "",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(transient)?;
            *consumer = Some(started);
        }

        match consumer
            .as_mut()
            .ok_or(BrokerError::SessionLost)?
            .next()
            .await
        {
            Some(Ok(delivery)) => Ok(Delivery {
                body: delivery.data,
                redelivered: delivery.redelivered,
                receipt: delivery.delivery_tag.to_string(),
            }),
            Some(Err(e)) => {
                warn!(error = %e, queue = %self.queue, "AMQP consumer error");
                Err(BrokerError::SessionLost)
            }
            // Stream end means the channel closed under us.
            None => Err(BrokerError::SessionLost),
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), BrokerError> {
        let tag = Self::parse_receipt(receipt)?;
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(transient)
    }

    async fn nack(&self, receipt: &str) -> Result<(), BrokerError> {
        let tag = Self::parse_receipt(receipt)?;
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(transient)
    }
}

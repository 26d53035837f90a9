//! Message bus plumbing: the durable intake consumer, the log-event
//! publisher, and the per-delivery settle surface the dispatcher works
//! against.

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use thiserror::Error;

use courier_common::events::{EventPublisher, PublishError};

/// How many deliveries may be in flight at once; the bus enforces the
/// worker concurrency cap through this prefetch window.
const PREFETCH: u16 = 10;

/// Redeliveries per message before the bus moves it to the poison path.
const DELIVERY_LIMIT: i32 = 5;

/// Failure to settle a delivery.
#[derive(Debug, Error)]
#[error("failed to settle delivery: {0}")]
pub struct BusError(String);

/// One consumed delivery: payload plus its settle operations. Exactly one
/// of `ack`/`nack` must be called, exactly once.
#[async_trait]
pub trait BusDelivery: Send + Sync {
    fn payload(&self) -> &[u8];
    async fn ack(&self) -> Result<(), BusError>;
    async fn nack(&self, requeue: bool) -> Result<(), BusError>;
}

#[async_trait]
impl BusDelivery for lapin::message::Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    async fn ack(&self) -> Result<(), BusError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|err| BusError(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|err| BusError(err.to_string()))
    }
}

/// One AMQP connection with its channel.
pub struct BusConnection {
    _connection: Connection,
    channel: Channel,
}

impl BusConnection {
    /// Dial the broker and open a channel.
    ///
    /// # Errors
    ///
    /// Returns the connection or channel error.
    pub async fn connect(url: &str) -> Result<Self, lapin::Error> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        Ok(Self {
            _connection: connection,
            channel,
        })
    }

    /// Declare the durable quorum intake queue and start consuming from it.
    ///
    /// The queue carries a per-message delivery limit, so repeatedly
    /// requeued messages end on the bus's poison path instead of looping
    /// forever.
    ///
    /// # Errors
    ///
    /// Returns the declaration or consume error.
    pub async fn mail_consumer(&self, queue: &str) -> Result<Consumer, lapin::Error> {
        let mut arguments = FieldTable::default();
        arguments.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
        arguments.insert("x-delivery-limit".into(), AMQPValue::LongInt(DELIVERY_LIMIT));

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;
        self.channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await?;
        self.channel
            .basic_consume(
                queue,
                "courier-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
    }

    /// Declare the durable log queue and wrap this connection as the
    /// event publisher for it.
    ///
    /// # Errors
    ///
    /// Returns the declaration error.
    pub async fn log_publisher(self, queue: &str) -> Result<LogPublisher, lapin::Error> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(LogPublisher {
            bus: self,
            queue: queue.to_string(),
        })
    }
}

/// Publishes serialized log events onto the side queue.
pub struct LogPublisher {
    bus: BusConnection,
    queue: String,
}

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), PublishError> {
        self.bus
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|err| PublishError(err.to_string()))?
            .await
            .map_err(|err| PublishError(err.to_string()))?;
        Ok(())
    }
}

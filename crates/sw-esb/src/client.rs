//! AMQP transport for the enterprise service bus.
//!
//! Consumption is auto-ack: the bus replays nothing, and a message that
//! fails downstream is dropped, not redelivered. The consumer and producer
//! seams are separate traits so the bridge sides can be exercised against
//! in-memory fakes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::Mutex;
use tracing::{debug, info};

use sw_common::{DispatchError, EsbConfig, Result};

/// Blocking-receive side of the bus. Single-consumer: concurrent callers
/// take turns.
#[async_trait]
pub trait EsbConsumer: Send + Sync {
    /// Next raw message. Waits until one arrives.
    async fn receive(&self) -> Result<Bytes>;
}

/// Publish side of the bus.
#[async_trait]
pub trait EsbProducer: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<()>;
}

fn transport(context: &str, e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Transport(format!("{context}: {e}"))
}

/// Lapin-backed client implementing both bus sides over one connection.
pub struct LapinEsbClient {
    _connection: Connection,
    channel: Channel,
    consumer: Mutex<Consumer>,
    exchange: String,
    routing_key: String,
}

impl LapinEsbClient {
    pub async fn connect(config: &EsbConfig) -> Result<Self> {
        let connection = Connection::connect(&config.uri, ConnectionProperties::default())
            .await
            .map_err(|e| transport("esb connect", e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| transport("esb channel", e))?;

        channel
            .queue_declare(
                &config.inbound_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport("esb queue declare", e))?;

        let consumer = channel
            .basic_consume(
                &config.inbound_queue,
                "sw-receiver",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport("esb consume", e))?;

        info!(queue = %config.inbound_queue, "esb consumer started");

        Ok(Self {
            _connection: connection,
            channel,
            consumer: Mutex::new(consumer),
            exchange: config.outbound_exchange.clone(),
            routing_key: config.outbound_routing_key.clone(),
        })
    }
}

#[async_trait]
impl EsbConsumer for LapinEsbClient {
    async fn receive(&self) -> Result<Bytes> {
        let mut consumer = self.consumer.lock().await;
        let delivery = consumer
            .next()
            .await
            .ok_or_else(|| DispatchError::Transport("esb consumer stream closed".to_string()))?
            .map_err(|e| transport("esb receive", e))?;

        debug!(bytes = delivery.data.len(), "esb message received");
        Ok(Bytes::from(delivery.data))
    }
}

#[async_trait]
impl EsbProducer for LapinEsbClient {
    async fn publish(&self, payload: &[u8]) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| transport("esb publish", e))?;

        confirm.await.map_err(|e| transport("esb confirm", e))?;
        Ok(())
    }
}

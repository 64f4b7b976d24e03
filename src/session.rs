// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Abstractions
//!
//! The connection manager, topology declarator, publisher and consumers only talk
//! to the broker through the traits in this module. `channel` provides the lapin
//! implementation; tests plug in mocks or an in-memory broker.
//!
//! A [`Session`] corresponds to an AMQP channel. It is only valid while the
//! connection that created it is alive, so callers fetch it from the
//! [`ConnectionManager`](crate::connection::ConnectionManager) for every operation
//! instead of keeping it around.

use crate::{
    configs::BrokerEndpoint,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::mpsc;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Stream of inbound deliveries. It ends, or yields an error, when the session is lost.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A usable handle for declaring, publishing and consuming.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync {
    /// Whether the underlying channel still accepts operations.
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes one message and waits for the broker to accept it.
    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError>;

    /// Subscribes to `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// The physical connection a session is multiplexed over.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Result of a successful dial: the connection, its session, and a receiver that
/// yields once the connection reports a failure.
pub struct Established {
    pub connection: Arc<dyn BrokerConnection>,
    pub session: Arc<dyn Session>,
    pub lost: mpsc::UnboundedReceiver<AmqpError>,
}

/// Dials the broker and opens a session on the new connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Established, AmqpError>;
}

/// A message ready to be handed to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub persistent: bool,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub content_type: String,
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(exchange: &str, routing_key: &str, payload: Vec<u8>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload,
            persistent: true,
            timestamp,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: uuid::Uuid::new_v4().to_string(),
            headers: BTreeMap::default(),
        }
    }
}

/// Resolves a delivery on the broker side.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// An inbound message, pending acknowledgement.
///
/// `ack` and `nack` take the delivery by value, so it can be resolved only once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// How many times the broker reports having delivered this message before,
    /// when it reports it at all.
    pub delivery_count: Option<i64>,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Delivery {
    pub fn new(delivery_tag: u64, data: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Delivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            delivery_count: None,
            headers: BTreeMap::default(),
            data,
            acker,
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn delivery_count(mut self, count: Option<i64>) -> Self {
        self.delivery_count = count;
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Decodes the JSON body.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data)
            .map_err(|err| AmqpError::HandlerFailure(format!("invalid payload: {}", err)))
    }

    /// Acknowledges the delivery, removing it from the queue.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Rejects the delivery. With `requeue` the broker redelivers it, otherwise it is
    /// dropped or dead-lettered according to the queue arguments.
    pub async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! lapin implementation of the transport traits. [`LapinConnector`] dials the
//! broker, opens a channel in publisher-confirm mode and wires the error callbacks
//! of both the connection and the channel to the loss receiver the connection
//! manager watches.

use crate::{
    configs::BrokerEndpoint,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueArgument, QueueBinding, QueueDefinition},
    session::{
        Acknowledger, BrokerConnection, Connector, Delivery, DeliveryStream, Established,
        OutboundMessage, Session,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Header set by quorum queues with the number of previous delivery attempts
pub const AMQP_HEADERS_DELIVERY_COUNT: &str = "x-delivery-count";
/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Dials RabbitMQ with lapin.
pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    pub fn new(connection_name: &str) -> Arc<LapinConnector> {
        Arc::new(LapinConnector {
            connection_name: connection_name.to_owned(),
        })
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Established, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = Connection::connect(endpoint.as_str(), options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                AmqpError::ConnectionError(err.to_string())
            })?;
        debug!("amqp connected");

        let (tx, lost) = mpsc::unbounded_channel();
        let channel_lost = tx.clone();
        conn.on_error(move |err| {
            let _ = tx.send(AmqpError::ConnectionLost(err.to_string()));
        });

        debug!("creating amqp channel...");
        let channel = match open_channel(&conn).await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close_err) = conn.close(REPLY_SUCCESS, "channel setup failed").await {
                    debug!(error = close_err.to_string(), "failure to close connection");
                }
                return Err(err);
            }
        };
        debug!("channel created");

        // a channel exception closes the channel but leaves the connection up
        channel.on_error(move |err| {
            let _ = channel_lost.send(AmqpError::ChannelClosed(err.to_string()));
        });

        Ok(Established {
            connection: Arc::new(LapinConnection { conn }),
            session: Arc::new(LapinSession { channel }),
            lost,
        })
    }
}

async fn open_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    let channel = conn.create_channel().await.map_err(|err| {
        error!(error = err.to_string(), "error to create the channel");
        AmqpError::ChannelError(err.to_string())
    })?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to enable publisher confirms");
            AmqpError::ChannelError(err.to_string())
        })?;

    Ok(channel)
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

struct LapinSession {
    channel: Channel,
}

#[async_trait]
impl Session for LapinSession {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "exchange_declare failed");
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                queue_arguments(def.arguments()),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                debug!(error = err.to_string(), "queue_declare failed");
                AmqpError::DeclareQueueError(def.name.clone())
            })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "queue_bind failed");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let headers: BTreeMap<ShortString, AMQPValue> = msg
            .headers
            .iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                )
            })
            .collect();

        let delivery_mode = if msg.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };

        let confirm = self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from(msg.content_type.clone()))
                    .with_message_id(ShortString::from(msg.message_id.clone()))
                    .with_delivery_mode(delivery_mode)
                    .with_timestamp(msg.timestamp)
                    .with_headers(FieldTable::from(headers)),
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        if confirm.is_nack() {
            return Err(AmqpError::PublishingError(
                "message was nacked by the broker".to_owned(),
            ));
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(into_delivery)
                    .map_err(|err| AmqpError::ChannelClosed(err.to_string()))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

fn queue_arguments(args: BTreeMap<String, QueueArgument>) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = args
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                QueueArgument::Text(v) => AMQPValue::LongString(LongString::from(v)),
                QueueArgument::Int(v) => AMQPValue::LongInt(LongInt::from(v)),
            };
            (ShortString::from(key), value)
        })
        .collect();

    FieldTable::from(table)
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let (headers, count) = extract_header_properties(&delivery.properties);

    Delivery::new(
        delivery.delivery_tag,
        delivery.data,
        Box::new(LapinAcker {
            acker: delivery.acker,
        }),
    )
    .exchange(delivery.exchange.as_str())
    .routing_key(delivery.routing_key.as_str())
    .redelivered(delivery.redelivered)
    .delivery_count(count)
    .headers(headers)
}

/// Extracts the string headers and the broker-reported delivery count.
///
/// The count comes from `x-delivery-count` (quorum queues) or, failing that, from
/// the `count` field of the first `x-death` entry.
fn extract_header_properties(props: &AMQPProperties) -> (BTreeMap<String, String>, Option<i64>) {
    let table = props.headers().clone().unwrap_or_default();
    let inner = table.inner();

    let headers = inner
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
                .ok()
                .map(|s| (key.to_string(), s.to_owned())),
            AMQPValue::ShortString(v) => Some((key.to_string(), v.to_string())),
            _ => None,
        })
        .collect();

    let count = inner
        .get(AMQP_HEADERS_DELIVERY_COUNT)
        .and_then(amqp_int)
        .or_else(|| {
            inner
                .get(AMQP_HEADERS_X_DEATH)
                .and_then(|value| value.as_array())
                .and_then(|arr| arr.as_slice().first())
                .and_then(|value| value.as_field_table())
                .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
                .and_then(amqp_int)
        });

    (headers, count)
}

fn amqp_int(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes JSON payloads as persistent messages with a bounded number of
//! attempts. The session is fetched from the connection manager for every
//! attempt; when there is none at call time the publish fails right away with
//! [`AmqpError::NotReady`] instead of waiting for a reconnect.

use crate::{
    backoff::Backoff,
    configs::RabbitMQConfigs,
    connection::ConnectionManager,
    errors::AmqpError,
    otel,
    session::OutboundMessage,
    topics,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

/// Retry budget of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicy {
    pub attempts: u32,
    /// Bound on each single attempt.
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        PublishPolicy {
            attempts: 5,
            timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }
}

impl PublishPolicy {
    pub fn from_configs(cfg: &RabbitMQConfigs) -> Self {
        PublishPolicy {
            attempts: cfg.publish_attempts.max(1),
            timeout: cfg.publish_timeout(),
            backoff: cfg.backoff(),
        }
    }
}

/// Publisher bound to a connection manager.
pub struct RabbitMQPublisher {
    manager: ConnectionManager,
    policy: PublishPolicy,
}

impl RabbitMQPublisher {
    pub fn new(manager: ConnectionManager, policy: PublishPolicy) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { manager, policy })
    }

    /// Serializes `payload` to JSON and publishes it to `exchange` with `routing_key`.
    ///
    /// May take up to `attempts × timeout` plus the backoff delays before failing
    /// with [`AmqpError::PublishExhausted`], which carries the last attempt's error.
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        if let Err(err) = self.manager.session() {
            warn!(exchange, routing_key, "broker not ready, message not published");
            return Err(err);
        }

        let mut msg = OutboundMessage::new(exchange, routing_key, body);
        otel::inject(&Context::current(), &mut msg.headers);

        self.publish_message(&msg).await
    }

    /// Publishes to the notification topic.
    pub async fn publish_notification<T>(&self, payload: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish(
            topics::NOTIFICATION_EXCHANGE,
            topics::NOTIFICATION_ROUTING_KEY,
            payload,
        )
        .await
    }

    /// Publishes to the user-management topic.
    pub async fn publish_user_management<T>(&self, payload: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish(topics::USER_EXCHANGE, topics::USER_ROUTING_KEY, payload)
            .await
    }

    async fn publish_message(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let attempts = self.policy.attempts.max(1);
        let mut last = AmqpError::InternalError;

        for attempt in 0..attempts {
            match self.attempt(msg).await {
                Ok(()) => {
                    info!(
                        exchange = msg.exchange.as_str(),
                        routing_key = msg.routing_key.as_str(),
                        payload = %String::from_utf8_lossy(&msg.payload),
                        attempt,
                        "message published"
                    );
                    return Ok(());
                }
                Err(err) => {
                    if attempt + 1 < attempts {
                        let delay = self.policy.backoff.delay(attempt);
                        warn!(
                            error = err.to_string(),
                            attempt,
                            delay_secs = delay.as_secs_f64(),
                            "publish failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last = err;
                }
            }
        }

        error!(
            error = last.to_string(),
            exchange = msg.exchange.as_str(),
            routing_key = msg.routing_key.as_str(),
            attempts,
            "failure to publish message after retries"
        );

        Err(AmqpError::PublishExhausted {
            attempts,
            last: Box::new(last),
        })
    }

    async fn attempt(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let session = self.manager.session()?;

        match tokio::time::timeout(self.policy.timeout, session.publish(msg)).await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::PublishTimeout(
                u64::try_from(self.policy.timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }
}

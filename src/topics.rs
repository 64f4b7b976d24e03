// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Auth Service Topics
//!
//! The two logical topics the auth service publishes to, and the topology that
//! backs them. Each exchange is a durable topic exchange with one durable queue
//! bound under the queue's own name.

use crate::{
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::Topology,
};

pub const NOTIFICATION_EXCHANGE: &str = "notification_exchange";
pub const NOTIFICATION_QUEUE: &str = "notification.queue";
pub const NOTIFICATION_ROUTING_KEY: &str = "notification.queue";

pub const USER_EXCHANGE: &str = "user_exchange";
pub const USER_QUEUE: &str = "user.queue";
pub const USER_ROUTING_KEY: &str = "user.queue";

/// Delivery reports of welcome emails, sent back by the notification service.
pub const EMAIL_ACK_QUEUE: &str = "notification_email_queue";
pub const EMAIL_ACK_ROUTING_KEY: &str = "notification.email.ack";
pub const EMAIL_ACK_CONSUMER: &str = "email-worker";

/// Exchanges, queues and bindings used by the auth service.
pub fn auth_topology() -> Topology {
    Topology::new()
        .exchange(ExchangeDefinition::new(NOTIFICATION_EXCHANGE).topic().durable())
        .exchange(ExchangeDefinition::new(USER_EXCHANGE).topic().durable())
        .queue(QueueDefinition::new(NOTIFICATION_QUEUE).durable())
        .queue(QueueDefinition::new(USER_QUEUE).durable())
        .queue(QueueDefinition::new(EMAIL_ACK_QUEUE).durable().with_dlq())
        .queue_binding(
            QueueBinding::new(NOTIFICATION_QUEUE)
                .exchange(NOTIFICATION_EXCHANGE)
                .routing_key(NOTIFICATION_ROUTING_KEY),
        )
        .queue_binding(
            QueueBinding::new(USER_QUEUE)
                .exchange(USER_EXCHANGE)
                .routing_key(USER_ROUTING_KEY),
        )
        .queue_binding(
            QueueBinding::new(EMAIL_ACK_QUEUE)
                .exchange(NOTIFICATION_EXCHANGE)
                .routing_key(EMAIL_ACK_ROUTING_KEY),
        )
}

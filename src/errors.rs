// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Connectivity Layer
//!
//! The `AmqpError` enum covers every failure the connection manager, topology
//! declarator, publisher and consumers can observe. Only a few of them ever reach
//! callers: `NotReady`, `PublishExhausted`, serialization and declaration errors.
//! Connection failures are retried internally and handler failures are turned
//! into negative acknowledgements.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// No session is currently available
    #[error("broker session not ready")]
    NotReady,

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The live connection reported a failure
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The session was closed while it was in use
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error subscribing a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error encoding a payload before publishing
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// A single publish attempt failed
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// A single publish attempt did not complete in time
    #[error("publish timed out after {0}ms")]
    PublishTimeout(u64),

    /// Every publish attempt failed
    #[error("failure to publish after {attempts} attempts")]
    PublishExhausted {
        attempts: u32,
        #[source]
        last: Box<AmqpError>,
    },

    /// The consumer handler rejected a delivery
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The consumer already has a running task
    #[error("consumer `{0}` already started")]
    AlreadyStarted(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

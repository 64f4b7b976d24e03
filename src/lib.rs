// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Auth Broker
//!
//! Resilient RabbitMQ connectivity for the auth service: a connection manager
//! that reconnects with exponential backoff, a retrying publisher with broker
//! confirms, and consumers that resume after every reconnect.

mod consumer;
mod otel;

pub mod backoff;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod readiness;
pub mod session;
pub mod topics;
pub mod topology;

#[cfg(test)]
mod testing;

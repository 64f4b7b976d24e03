// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use auth_broker::{
    configs::RabbitMQConfigs,
    connection::ConnectionManager,
    dispatcher::{ConsumerHandler, ConsumerRegistration, RabbitMQConsumer},
    errors::AmqpError,
    session::Delivery,
    topics::{self, EMAIL_ACK_CONSUMER, EMAIL_ACK_QUEUE},
};
use opentelemetry::Context;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Delivery report sent back by the notification service.
#[derive(Debug, Deserialize)]
struct EmailAck {
    user_id: String,
    #[serde(default)]
    status: String,
}

struct EmailAckHandler;

#[async_trait]
impl ConsumerHandler for EmailAckHandler {
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
        let ack: EmailAck = delivery.payload()?;
        info!(
            user_id = ack.user_id.as_str(),
            status = ack.status.as_str(),
            "welcome email report received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = RabbitMQConfigs::from_env()?;
    let manager = ConnectionManager::from_configs(&cfg)?;
    info!(broker = %manager.endpoint(), "connecting to broker");

    manager.connect().await;
    manager.declare_topology(&topics::auth_topology()).await?;

    let consumer = RabbitMQConsumer::new(
        manager.clone(),
        ConsumerRegistration::new(EMAIL_ACK_QUEUE, EMAIL_ACK_CONSUMER, Arc::new(EmailAckHandler)),
    );
    consumer.start()?;

    if let Err(err) = wait_for_shutdown().await {
        error!(error = err.to_string(), "failure to listen for shutdown signal");
    }

    info!("shutting down");
    consumer.stop().await;
    manager.close().await;

    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C");
    }

    Ok(())
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! A [`Topology`] groups the exchanges, queues and bindings a service relies on.
//! Installing it declares every exchange, then every queue (dead letter queues
//! before the queue that points at them), then every binding, so that a binding
//! never references something not yet declared.
//!
//! Declarations rely on the broker's idempotent declare semantics: installing the
//! same topology twice succeeds and creates nothing new.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    session::Session,
};
use tracing::{debug, error};

/// Set of exchanges, queues and bindings to declare.
///
/// Adding an element equal to one already present is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        if !self.exchanges.contains(&def) {
            self.exchanges.push(def);
        }
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        if !self.queues.contains(&def) {
            self.queues.push(def);
        }
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.queues_binding.is_empty()
    }

    /// Declares the whole topology on `session`, stopping at the first failure.
    pub async fn install(&self, session: &dyn Session) -> Result<(), AmqpError> {
        self.install_exchange(session).await?;
        self.install_queue(session).await?;
        self.binding_queues(session).await
    }

    async fn install_exchange(&self, session: &dyn Session) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            session.declare_exchange(exch).await.inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exch.name.as_str(),
                    "error to declare the exchange"
                )
            })?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self, session: &dyn Session) -> Result<(), AmqpError> {
        for def in &self.queues {
            if let Some(dlq) = def.dlq_definition() {
                debug!("creating dlq: {}", dlq.name);
                session.declare_queue(&dlq).await.inspect_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = dlq.name.as_str(),
                        "failure to declare dlq"
                    )
                })?;
            }

            debug!("creating queue: {}", def.name);
            session.declare_queue(def).await.inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "failure to declare queue"
                )
            })?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self, session: &dyn Session) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            session.bind_queue(binding).await.inspect_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange")
            })?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer
//!
//! A consumer binds one queue to an application handler. Once started it runs in
//! its own task:
//!
//! 1. wait on the readiness signal of the connection manager for a session it has
//!    not consumed from yet;
//! 2. subscribe to the queue with manual acknowledgement and hand every delivery
//!    to the handler (see [`consumer`](crate::consumer) for ack/nack rules);
//! 3. when the delivery stream ends or fails, go back to 1.
//!
//! A subscription the broker refuses is retried on the manager's backoff schedule.
//! If the refusal closed the channel, the consumer first waits for the connection
//! manager to replace the session.
//!
//! The task exits when it is stopped or when the connection manager is closed.
//! Cancellation is checked between deliveries, so an in-flight handler always runs
//! to completion.

use crate::{
    connection::ConnectionManager,
    consumer::consume,
    errors::AmqpError,
    session::Delivery,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    Context,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Application callback invoked for every delivery of a consumer.
///
/// `ctx` carries the trace context propagated by the publisher. Returning an error
/// rejects the delivery; it is never surfaced outside the consumer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError>;
}

/// Queue, consumer tag and handler of a consumer.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub(crate) queue: String,
    pub(crate) tag: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) dead_letter_after: Option<i64>,
}

impl ConsumerRegistration {
    pub fn new(queue: &str, tag: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        ConsumerRegistration {
            queue: queue.to_owned(),
            tag: tag.to_owned(),
            handler,
            dead_letter_after: None,
        }
    }

    /// Rejects a failing delivery without requeue once the broker reports it has
    /// been delivered `count` times. Needs a broker that reports delivery counts
    /// (quorum queues, or the `x-death` header of a dead-letter cycle).
    pub fn dead_letter_after(mut self, count: i64) -> Self {
        self.dead_letter_after = Some(count);
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct RabbitMQConsumer {
    manager: ConnectionManager,
    registration: Arc<ConsumerRegistration>,
    running: Mutex<Option<Running>>,
}

impl RabbitMQConsumer {
    pub fn new(manager: ConnectionManager, registration: ConsumerRegistration) -> Self {
        RabbitMQConsumer {
            manager,
            registration: Arc::new(registration),
            running: Mutex::new(None),
        }
    }

    pub fn registration(&self) -> &ConsumerRegistration {
        &self.registration
    }

    /// Spawns the consume task.
    ///
    /// Fails with [`AmqpError::AlreadyStarted`] while a previous task is still
    /// running. A consumer whose task ended, because it was stopped or because the
    /// manager closed, can be started again.
    pub fn start(&self) -> Result<(), AmqpError> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(AmqpError::AlreadyStarted(self.registration.tag.clone()));
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            self.manager.clone(),
            self.registration.clone(),
            cancel.clone(),
        ));

        info!(
            consumer = self.registration.tag.as_str(),
            queue = self.registration.queue.as_str(),
            "consumer started"
        );

        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Cancels the consume task and waits for it to finish. Calling it again, or
    /// on a consumer that never started, does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(err) = running.task.await {
            error!(
                consumer = self.registration.tag.as_str(),
                error = err.to_string(),
                "consumer task failed"
            );
        }

        info!(consumer = self.registration.tag.as_str(), "consumer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }
}

impl Drop for RabbitMQConsumer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

enum Exit {
    Cancelled,
    SessionEnded,
    SubscribeFailed,
}

async fn run(
    manager: ConnectionManager,
    registration: Arc<ConsumerRegistration>,
    cancel: CancellationToken,
) {
    let tracer = global::tracer("amqp consumer");
    let backoff = manager.backoff();
    let mut readiness = manager.notify_ready();
    let mut failures: u32 = 0;

    loop {
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            ready = readiness.ready() => ready,
        };

        let Some(generation) = ready else {
            debug!(
                consumer = registration.tag.as_str(),
                "connection manager closed, consumer exiting"
            );
            return;
        };

        loop {
            match consume_session(&manager, &registration, &tracer, &cancel, generation).await {
                Exit::Cancelled => return,
                Exit::SessionEnded => {
                    failures = 0;
                    // wakes the manager when the broker closed the channel only
                    manager.check_session();
                    warn!(
                        consumer = registration.tag.as_str(),
                        generation, "session ended, waiting for the connection to come back"
                    );
                    break;
                }
                Exit::SubscribeFailed => {
                    let delay = backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    if !manager.check_session() {
                        break;
                    }
                }
            }
        }
    }
}

async fn consume_session(
    manager: &ConnectionManager,
    registration: &ConsumerRegistration,
    tracer: &BoxedTracer,
    cancel: &CancellationToken,
    generation: u64,
) -> Exit {
    let session = match manager.session() {
        Ok(session) => session,
        Err(err) => {
            warn!(
                consumer = registration.tag.as_str(),
                error = err.to_string(),
                "session lost before subscribing"
            );
            return Exit::SessionEnded;
        }
    };

    let mut deliveries = match session.consume(&registration.queue, &registration.tag).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(
                consumer = registration.tag.as_str(),
                queue = registration.queue.as_str(),
                error = err.to_string(),
                "error to create the consumer"
            );
            return Exit::SubscribeFailed;
        }
    };
    drop(session);

    info!(
        consumer = registration.tag.as_str(),
        queue = registration.queue.as_str(),
        generation,
        "consuming"
    );

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Exit::Cancelled,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                warn!(
                    consumer = registration.tag.as_str(),
                    error = err.to_string(),
                    "delivery stream failed"
                );
                return Exit::SessionEnded;
            }
            None => return Exit::SessionEnded,
        };

        match consume(tracer, delivery, registration).await {
            Ok(outcome) => debug!(?outcome, "delivery resolved"),
            Err(err) => error!(error = err.to_string(), "error consume msg"),
        }
    }
}

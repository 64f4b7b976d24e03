// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handling
//!
//! Runs the handler of a consumer registration on one delivery and resolves the
//! delivery according to the outcome:
//! - handler success: ack;
//! - handler failure: nack with requeue, so the broker redelivers it;
//! - handler failure on a delivery the broker has already delivered at least
//!   `dead_letter_after` times: nack without requeue, so the broker dead-letters it.
//!
//! Handler failures never leave this module; a failed ack or nack is reported to
//! the caller for logging only.

use crate::{dispatcher::ConsumerRegistration, errors::AmqpError, otel, session::Delivery};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acked,
    Requeued,
    DeadLettered,
}

pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    registration: &ConsumerRegistration,
) -> Result<Outcome, AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, &registration.queue);

    debug!(
        consumer = registration.tag.as_str(),
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "received: {} - exchange: {}",
        delivery.routing_key,
        delivery.exchange,
    );

    let result = registration.handler.exec(&ctx, &delivery).await;

    let Err(err) = result else {
        debug!("message successfully processed");
        return match delivery.ack().await {
            Ok(()) => {
                span.set_status(Status::Ok);
                Ok(Outcome::Acked)
            }
            Err(e) => {
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(e)
            }
        };
    };

    span.record_error(&err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });

    let exhausted = match (registration.dead_letter_after, delivery.delivery_count) {
        (Some(max), Some(count)) => count >= max,
        _ => false,
    };

    if exhausted {
        error!(
            consumer = registration.tag.as_str(),
            error = err.to_string(),
            "too many attempts, dead-lettering message"
        );
        delivery.nack(false).await?;
        return Ok(Outcome::DeadLettered);
    }

    warn!(
        consumer = registration.tag.as_str(),
        error = err.to_string(),
        "handler error, requeuing message"
    );
    delivery.nack(true).await?;
    Ok(Outcome::Requeued)
}

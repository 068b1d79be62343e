// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Runs the handler of a subscription for one delivery and settles it with the broker.
//! Failed deliveries are retried through the subscription's dead-letter cycle, using the
//! broker's `x-death` header as the count of attempts already made. Once the cycle's
//! retries are exhausted the delivery is acknowledged, dropping the message.

use crate::{
    errors::AmqpError, handler::DeliveryExecutor, otel, subscription::DeadLetterCycle,
    subscription::Subscription,
};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    types::AMQPValue,
};
use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span, Status},
};
use std::borrow::Cow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Log target of every consumer-side event.
pub(crate) const LOG_TARGET: &str = "amqp_relay::consumer";

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// How a delivery must be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Handled successfully, ack.
    Handled,
    /// Failed with retries left, reject without requeue so it enters the dead-letter cycle.
    Retry { attempts_left: i64 },
    /// Failed with no retry left, ack and lose the message.
    Dropped { attempts: i64 },
}

/// Number of delivery attempts already made, read from `x-death[0].count`.
pub(crate) fn attempts_made(props: &AMQPProperties) -> i64 {
    props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_X_DEATH))
        .and_then(AMQPValue::as_array)
        .and_then(|deaths| deaths.as_slice().first())
        .and_then(AMQPValue::as_field_table)
        .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
        .and_then(as_count)
        .unwrap_or_default()
}

fn as_count(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        _ => None,
    }
}

/// Settlement of a failed delivery.
pub(crate) fn failure_outcome(
    dead_letter: Option<&DeadLetterCycle>,
    attempts_made: i64,
) -> Outcome {
    match dead_letter {
        Some(cycle) if attempts_made < i64::from(cycle.max_retry_count) => Outcome::Retry {
            attempts_left: i64::from(cycle.max_retry_count) - attempts_made,
        },
        _ => Outcome::Dropped {
            attempts: attempts_made + 1,
        },
    }
}

/// Runs the handler on `payload` and decides how the delivery must be settled.
pub(crate) async fn process(
    executor: &dyn DeliveryExecutor,
    dead_letter: Option<&DeadLetterCycle>,
    payload: &[u8],
    attempts_made: i64,
    cancellation: CancellationToken,
) -> Outcome {
    match executor.execute(payload, cancellation).await {
        Ok(()) => Outcome::Handled,
        Err(err) => {
            let outcome = failure_outcome(dead_letter, attempts_made);
            match outcome {
                Outcome::Retry { attempts_left } => warn!(
                    target: LOG_TARGET,
                    error = err.to_string(),
                    attempts_left = attempts_left,
                    "error whiling handling msg, sending to the dead-letter cycle"
                ),
                Outcome::Dropped { attempts } => error!(
                    target: LOG_TARGET,
                    error = err.to_string(),
                    attempts = attempts,
                    "error whiling handling msg, no retry left, message lost"
                ),
                Outcome::Handled => {}
            }
            outcome
        }
    }
}

/// Processes one delivery of `subscription`, consumed from `queue`, and acks or nacks it.
pub(crate) async fn consume(
    queue: &str,
    subscription: &Subscription,
    delivery: Delivery,
    cancellation: CancellationToken,
) -> Result<(), AmqpError> {
    let attempts = attempts_made(&delivery.properties);
    let tracer = global::tracer("amqp consumer");
    let (_ctx, mut span) =
        otel::new_span(&delivery.properties, &tracer, subscription.message_type());

    debug!(
        target: LOG_TARGET,
        queue = queue,
        message_type = subscription.message_type(),
        delivery_tag = delivery.delivery_tag,
        payload = %String::from_utf8_lossy(&delivery.data),
        attempts = attempts,
        "message received"
    );

    let outcome = process(
        subscription.executor.as_ref(),
        subscription.dead_letter(),
        &delivery.data,
        attempts,
        cancellation,
    )
    .await;

    settle(queue, &delivery, outcome, &mut span).await
}

async fn settle(
    queue: &str,
    delivery: &Delivery,
    outcome: Outcome,
    span: &mut BoxedSpan,
) -> Result<(), AmqpError> {
    match outcome {
        Outcome::Handled => {
            ack(delivery, span).await?;
            span.set_status(Status::Ok);
            info!(
                target: LOG_TARGET,
                queue = queue,
                delivery_tag = delivery.delivery_tag,
                "message successfully processed"
            );
        }
        Outcome::Retry { .. } => {
            span.set_status(Status::Error {
                description: Cow::from("handler failure, message retried"),
            });
            let options = BasicNackOptions {
                multiple: false,
                requeue: false,
            };
            if let Err(err) = delivery.nack(options).await {
                error!(target: LOG_TARGET, error = err.to_string(), "error whiling nack msg");
                span.record_error(&err);
                return Err(AmqpError::NackMessageError);
            }
        }
        Outcome::Dropped { .. } => {
            span.set_status(Status::Error {
                description: Cow::from("handler failure, message dropped"),
            });
            ack(delivery, span).await?;
        }
    }

    Ok(())
}

async fn ack(delivery: &Delivery, span: &mut BoxedSpan) -> Result<(), AmqpError> {
    if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
        error!(target: LOG_TARGET, error = err.to_string(), "error whiling ack msg");
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("error to ack msg"),
        });
        return Err(AmqpError::AckMessageError);
    }

    Ok(())
}

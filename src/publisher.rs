// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes JSON messages to exchanges or queues of the configured producer instances.
//! Each publish borrows a channel from the instance's [`LimitedPool`] and returns it once
//! done. Publishing is fire-and-forget: a serialization or broker failure is retried as
//! configured, then logged, and never reported to the caller.
//!
//! Publishing to an exchange waits for the [`ReadySignal`], which fires once every
//! consumer has declared its topology, so no message is routed to an exchange whose
//! queues are not bound yet.

use crate::{
    builder::{InstanceBuildResult, DEFAULT_INSTANCE_NAME},
    codec::{self, JSON_CONTENT_TYPE},
    config::ProducerConfig,
    connection::ConnectionHolder,
    errors::AmqpError,
    handler::Message,
    otel,
    pool::{LimitedPool, SharedPool},
};
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Log target of every producer-side event.
pub(crate) const LOG_TARGET: &str = "amqp_relay::producer";

/// One-shot signal telling that every consumer finished its setup pass.
#[derive(Clone)]
pub struct ReadySignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ReadySignal {
    fn default() -> Self {
        let (sender, _) = watch::channel(false);
        ReadySignal {
            sender: Arc::new(sender),
        }
    }
}

impl ReadySignal {
    pub fn new() -> ReadySignal {
        ReadySignal::default()
    }

    /// Fires the signal. Firing more than once has no further effect.
    pub fn fire(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.sender.borrow()
    }

    /// Suspends until the signal has fired.
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|ready| *ready).await;
    }
}

/// Where a message is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target<'a> {
    Exchange { name: &'a str, routing_key: &'a str },
    Queue(&'a str),
}

impl Target<'_> {
    fn exchange(&self) -> &str {
        match self {
            Target::Exchange { name, .. } => name,
            Target::Queue(_) => "",
        }
    }

    fn routing_key(&self) -> &str {
        match self {
            Target::Exchange { routing_key, .. } => routing_key,
            Target::Queue(queue) => queue,
        }
    }
}

struct ProducerSlot {
    config: ProducerConfig,
    pool: SharedPool<Channel>,
}

/// Publisher over every producer instance.
pub struct Publisher {
    producers: HashMap<String, ProducerSlot>,
    ready: ReadySignal,
}

impl Publisher {
    /// Creates one channel pool per producer instance. Channels are opened lazily,
    /// over the instance connection kept by `holder`.
    pub(crate) fn new(
        instances: &[InstanceBuildResult],
        holder: Arc<ConnectionHolder>,
        ready: ReadySignal,
    ) -> Result<Publisher, AmqpError> {
        let mut producers = HashMap::new();

        for instance in instances {
            let Some(producer) = instance.producer() else {
                continue;
            };

            let pool = LimitedPool::new(producer.config.max_pool_length, {
                let holder = holder.clone();
                let instance = instance.clone();
                move || open_channel(holder.clone(), instance.clone())
            })?;

            producers.insert(
                instance.name.clone(),
                ProducerSlot {
                    config: producer.config.clone(),
                    pool: Arc::new(pool),
                },
            );
        }

        Ok(Publisher { producers, ready })
    }

    /// Publishes to `exchange` through the default instance.
    pub async fn publish<M: Message>(&self, message: &M, exchange: &str) -> Result<(), AmqpError> {
        self.publish_to_exchange(DEFAULT_INSTANCE_NAME, message, exchange, "")
            .await
    }

    /// Publishes to `exchange` through `instance`.
    pub async fn publish_on<M: Message>(
        &self,
        instance: &str,
        message: &M,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        self.publish_to_exchange(instance, message, exchange, "")
            .await
    }

    /// Publishes to `exchange` with a routing key through `instance`.
    ///
    /// Waits for the consumers to be ready first. Only an unknown instance or a
    /// disposed publisher are reported as errors.
    ///
    /// # Parameters
    /// * `instance` - Name of an instance with a producer
    /// * `message` - Payload, serialized as JSON
    /// * `exchange` - Destination exchange, declared by a subscription or init operation
    /// * `routing_key` - Routing key, empty for fanout exchanges
    ///
    /// # Returns
    /// `UnknownInstance` when `instance` has no producer, `AlreadyDisposed` once the
    /// publisher is closed, otherwise `Ok(())` even when publishing failed
    pub async fn publish_to_exchange<M: Message>(
        &self,
        instance: &str,
        message: &M,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let target = Target::Exchange {
            name: exchange,
            routing_key,
        };
        self.send(instance, message, target).await
    }

    /// Publishes to `queue` through the default exchange of `instance`.
    ///
    /// Unlike exchange publishing this does not wait for the consumers, the queue must
    /// already exist.
    ///
    /// # Returns
    /// Same errors as [`Publisher::publish_to_exchange`]
    pub async fn enqueue<M: Message>(
        &self,
        instance: &str,
        message: &M,
        queue: &str,
    ) -> Result<(), AmqpError> {
        self.send(instance, message, Target::Queue(queue)).await
    }

    /// Stops handing out channels and closes every channel opened so far.
    pub(crate) async fn close(&self) {
        for (name, slot) in &self.producers {
            slot.pool.close();

            for channel in slot.pool.created() {
                if let Err(err) = channel.close(200, "publisher closed").await {
                    debug!(
                        target: LOG_TARGET,
                        error = err.to_string(),
                        instance = name,
                        "failure to close the publishing channel"
                    );
                }
            }
        }
    }

    async fn send<M: Message>(
        &self,
        instance: &str,
        message: &M,
        target: Target<'_>,
    ) -> Result<(), AmqpError> {
        let slot = self
            .producers
            .get(instance)
            .ok_or_else(|| AmqpError::UnknownInstance(instance.to_owned()))?;

        let channel = slot.pool.take().await?;

        if matches!(target, Target::Exchange { .. }) {
            self.ready.wait().await;
        }

        let message_type = std::any::type_name::<M>();
        let result = match codec::encode(message) {
            Ok(payload) => {
                publish_with_retry(&slot.config, || {
                    basic_publish(&channel, target, message_type, &payload)
                })
                .await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => info!(
                target: LOG_TARGET,
                instance = instance,
                exchange = target.exchange(),
                routing_key = target.routing_key(),
                message_type = message_type,
                "message published"
            ),
            Err(err) => error!(
                target: LOG_TARGET,
                error = err.to_string(),
                instance = instance,
                exchange = target.exchange(),
                routing_key = target.routing_key(),
                message_type = message_type,
                "failure to publish message"
            ),
        }

        Ok(())
    }
}

async fn open_channel(
    holder: Arc<ConnectionHolder>,
    instance: InstanceBuildResult,
) -> Result<Channel, AmqpError> {
    let conn = holder.get_or_create(&instance).await?;

    conn.create_channel().await.map_err(|err| {
        error!(
            target: LOG_TARGET,
            error = err.to_string(),
            instance = instance.name,
            "error to create the publishing channel"
        );
        AmqpError::ChannelError
    })
}

async fn basic_publish(
    channel: &Channel,
    target: Target<'_>,
    message_type: &str,
    payload: &[u8],
) -> Result<(), AmqpError> {
    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_type(ShortString::from(message_type))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(otel::current_context_headers()));

    channel
        .basic_publish(
            target.exchange(),
            target.routing_key(),
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            payload,
            properties,
        )
        .await
        .map(|_| ())
        .map_err(|err| {
            debug!(target: LOG_TARGET, error = err.to_string(), "basic publish failed");
            AmqpError::PublishingError
        })
}

/// Runs `attempt`, retrying a failed publish up to `max_retry_count` times,
/// `attempt_delay` apart.
pub(crate) async fn publish_with_retry<F, Fut>(
    config: &ProducerConfig,
    mut attempt: F,
) -> Result<(), AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), AmqpError>>,
{
    let mut retries = 0;

    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(err) if retries < config.max_retry_count => {
                retries += 1;
                warn!(
                    target: LOG_TARGET,
                    error = err.to_string(),
                    retry = retries,
                    max_retry_count = config.max_retry_count,
                    "failure to publish, trying again"
                );
                tokio::time::sleep(config.attempt_delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

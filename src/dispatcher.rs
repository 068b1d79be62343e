// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Host
//!
//! Starts the consumers of every instance. For each instance, a single channel is
//! shared by all of its subscriptions: each subscription declares its topology, sets
//! its own prefetch and starts a listener. Deliveries of the whole instance are bounded
//! by the consumer max degree of parallelism.
//!
//! Failures are isolated: a subscription that cannot be set up is skipped, and so is an
//! instance that cannot connect. The [`ReadySignal`] fires after the startup pass, in
//! every case.

use crate::{
    builder::{ConsumerBuildResult, InstanceBuildResult},
    connection::ConnectionHolder,
    consumer::{self, LOG_TARGET},
    errors::AmqpError,
    publisher::ReadySignal,
    subscription::Subscription,
    topology::{TopologyChannel, TopologyPlan},
};
use futures_util::{Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use std::{future::Future, sync::Arc};
use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

/// Lifecycle of a subscription listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Registered,
    Active,
    Cancelled,
    ShutDown,
    Unregistered,
}

/// Subscription bound to the queue it consumes from.
struct Listener {
    queue: String,
    consumer_tag: String,
    subscription: Subscription,
}

/// Starts and tracks the consumers of every instance.
pub(crate) struct ConsumerHost {
    holder: Arc<ConnectionHolder>,
    ready: ReadySignal,
    tasks: TaskTracker,
}

impl ConsumerHost {
    pub(crate) fn new(holder: Arc<ConnectionHolder>, ready: ReadySignal) -> ConsumerHost {
        ConsumerHost {
            holder,
            ready,
            tasks: TaskTracker::new(),
        }
    }

    /// Runs the startup pass over `instances`, then fires the ready signal.
    ///
    /// Returns the number of listeners started.
    pub(crate) async fn start(
        &self,
        instances: &[InstanceBuildResult],
        cancellation: &CancellationToken,
    ) -> usize {
        let mut started = 0;

        for instance in instances {
            let Some(consumer) = instance.consumer() else {
                continue;
            };

            match self.start_instance(instance, consumer, cancellation).await {
                Ok(count) => started += count,
                Err(err) => error!(
                    target: LOG_TARGET,
                    error = err.to_string(),
                    instance = instance.name,
                    "failure to start the consumers of the instance"
                ),
            }
        }

        self.ready.fire();
        started
    }

    /// Waits for every listener and every in-flight delivery to finish.
    pub(crate) async fn stopped(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn start_instance(
        &self,
        instance: &InstanceBuildResult,
        consumer: &ConsumerBuildResult,
        cancellation: &CancellationToken,
    ) -> Result<usize, AmqpError> {
        let conn = self.holder.get_or_create(instance).await?;
        let channel = conn.create_channel().await.map_err(|err| {
            error!(
                target: LOG_TARGET,
                error = err.to_string(),
                "error to create the consumer channel"
            );
            AmqpError::ChannelError
        })?;

        let dispatch = Arc::new(Semaphore::new(usize::from(instance.dispatch_concurrency())));
        let mut started = 0;

        let declared = declare_subscriptions(&channel, &instance.name, consumer).await;
        for (subscription, queue) in declared {
            match self
                .start_subscription(&channel, subscription, queue, dispatch.clone(), cancellation)
                .await
            {
                Ok(()) => {
                    started += 1;
                    info!(
                        target: LOG_TARGET,
                        instance = instance.name,
                        subscription = subscription.name(),
                        "consumer created"
                    );
                }
                Err(err) => error!(
                    target: LOG_TARGET,
                    error = err.to_string(),
                    instance = instance.name,
                    subscription = subscription.name(),
                    "failure to create consumer"
                ),
            }
        }

        Ok(started)
    }

    async fn start_subscription(
        &self,
        channel: &Channel,
        subscription: &Subscription,
        queue: String,
        dispatch: Arc<Semaphore>,
        cancellation: &CancellationToken,
    ) -> Result<(), AmqpError> {
        if let Err(err) = channel
            .basic_qos(
                subscription.max_degree_of_parallelism(),
                BasicQosOptions { global: false },
            )
            .await
        {
            error!(
                target: LOG_TARGET,
                error = err.to_string(),
                queue = queue,
                "error to set the prefetch"
            );
            return Err(AmqpError::QoSDeclarationError(queue));
        }

        let deliveries = match channel
            .basic_consume(
                &queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    error = err.to_string(),
                    queue = queue,
                    "error to create the consumer"
                );
                return Err(AmqpError::ConsumerDeclarationError(queue));
            }
            Ok(c) => c,
        };

        let consumer_tag = deliveries.tag().as_str().to_owned();
        info!(
            target: LOG_TARGET,
            queue = queue,
            consumer_tag = consumer_tag,
            state = ?ListenerState::Registered,
            "consumer registered"
        );

        let cancel = {
            let channel = channel.clone();
            let tag = consumer_tag.clone();
            move || async move {
                channel
                    .basic_cancel(&tag, BasicCancelOptions { nowait: true })
                    .await
            }
        };

        let listener = Arc::new(Listener {
            queue,
            consumer_tag,
            subscription: subscription.clone(),
        });

        self.tasks.spawn(listen(
            deliveries,
            cancel,
            listener,
            dispatch,
            self.tasks.clone(),
            cancellation.clone(),
        ));

        Ok(())
    }
}

/// Declares the topology of every subscription of `consumer`, in order.
///
/// A subscription whose topology cannot be declared is logged and left out, the
/// others are still declared.
///
/// # Returns
/// Every declared subscription with the name of the queue it consumes from
async fn declare_subscriptions<'a>(
    channel: &dyn TopologyChannel,
    instance: &str,
    consumer: &'a ConsumerBuildResult,
) -> Vec<(&'a Subscription, String)> {
    let mut declared = Vec::with_capacity(consumer.subscriptions.len());

    for subscription in &consumer.subscriptions {
        info!(
            target: LOG_TARGET,
            instance = instance,
            subscription = subscription.name(),
            message_type = subscription.message_type(),
            handler_type = subscription.handler_type(),
            "creating consumer"
        );

        let plan = TopologyPlan::for_subscription(subscription, &consumer.config);
        let installed = plan.install(channel).await;
        match installed {
            Ok(()) => declared.push((subscription, plan.queue)),
            Err(err) => error!(
                target: LOG_TARGET,
                error = err.to_string(),
                instance = instance,
                subscription = subscription.name(),
                "failure to declare the consumer topology"
            ),
        }
    }

    declared
}

/// Feeds `deliveries` to the subscription until the stream ends, fails, or the relay
/// is cancelled. `cancel` unregisters the consumer from the broker on cancellation.
async fn listen<S, C, Fut>(
    mut deliveries: S,
    cancel: C,
    listener: Arc<Listener>,
    dispatch: Arc<Semaphore>,
    tasks: TaskTracker,
    cancellation: CancellationToken,
) -> ListenerState
where
    S: Stream<Item = Result<Delivery, lapin::Error>> + Unpin + Send,
    C: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<(), lapin::Error>> + Send,
{
    debug!(
        target: LOG_TARGET,
        queue = listener.queue,
        state = ?ListenerState::Active,
        "listening"
    );

    let state = loop {
        let next = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break ListenerState::Cancelled,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                error!(
                    target: LOG_TARGET,
                    error = err.to_string(),
                    queue = listener.queue,
                    "consumer failure"
                );
                break ListenerState::ShutDown;
            }
            None => break ListenerState::Unregistered,
        };

        // left unacked, the broker redelivers it
        if cancellation.is_cancelled() {
            continue;
        }

        let permit = tokio::select! {
            permit = dispatch.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break ListenerState::ShutDown,
            },
            _ = cancellation.cancelled() => continue,
        };

        let listener = listener.clone();
        let cancellation = cancellation.clone();
        tasks.spawn(async move {
            if let Err(err) = consumer::consume(
                &listener.queue,
                &listener.subscription,
                delivery,
                cancellation,
            )
            .await
            {
                error!(
                    target: LOG_TARGET,
                    error = err.to_string(),
                    queue = listener.queue,
                    "error consume msg"
                );
            }
            drop(permit);
        });
    };

    if state == ListenerState::Cancelled {
        if let Err(err) = cancel().await {
            warn!(
                target: LOG_TARGET,
                error = err.to_string(),
                queue = listener.queue,
                "failure to cancel the consumer"
            );
        }
    }

    info!(
        target: LOG_TARGET,
        queue = listener.queue,
        consumer_tag = listener.consumer_tag,
        state = ?state,
        "consumer stopped"
    );

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::ConsumerBuilder,
        config::ConsumerConfig,
        subscription::tests::exchange_subscription,
        topology::MockTopologyChannel,
    };
    use futures_util::stream;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    fn listener() -> Arc<Listener> {
        Arc::new(Listener {
            queue: "orders_billing_main_queue".to_owned(),
            consumer_tag: "ctag-1".to_owned(),
            subscription: exchange_subscription("orders").build().unwrap(),
        })
    }

    async fn no_cancel() -> Result<(), lapin::Error> {
        Ok(())
    }

    #[tokio::test]
    async fn failed_topology_skips_only_its_subscription() {
        let consumer = ConsumerBuilder::new(ConsumerConfig::new("billing", 4))
            .subscribe(exchange_subscription("orders").build())
            .subscribe(exchange_subscription("payments").build())
            .subscribe(exchange_subscription("refunds").build())
            .build()
            .unwrap();

        let mut channel = MockTopologyChannel::new();
        channel
            .expect_declare_exchange()
            .withf(|d| d.name() == Some("payments"))
            .times(1)
            .returning(|_| Err(AmqpError::DeclareExchangeError("payments".to_owned())));
        channel
            .expect_declare_exchange()
            .times(2)
            .returning(|_| Ok(()));
        channel.expect_declare_queue().times(2).returning(|_| Ok(()));
        channel.expect_bind_queue().times(2).returning(|_| Ok(()));

        let declared = declare_subscriptions(&channel, "main", &consumer).await;
        let declared: Vec<(&str, &str)> = declared
            .iter()
            .map(|(subscription, queue)| (subscription.name(), queue.as_str()))
            .collect();

        assert_eq!(
            declared,
            vec![
                ("orders", "orders_billing_main_queue"),
                ("refunds", "refunds_billing_main_queue"),
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_unregisters_the_consumer() {
        let token = CancellationToken::new();
        let unregistered = Arc::new(AtomicBool::new(false));
        let flag = unregistered.clone();

        let listening = tokio::spawn(listen(
            stream::pending::<Result<Delivery, lapin::Error>>(),
            move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
            listener(),
            Arc::new(Semaphore::new(1)),
            TaskTracker::new(),
            token.clone(),
        ));

        token.cancel();
        let state = tokio::time::timeout(Duration::from_secs(1), listening)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(state, ListenerState::Cancelled);
        assert!(unregistered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ended_stream_means_unregistered() {
        let state = listen(
            stream::empty::<Result<Delivery, lapin::Error>>(),
            no_cancel,
            listener(),
            Arc::new(Semaphore::new(1)),
            TaskTracker::new(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, ListenerState::Unregistered);
    }

    #[tokio::test]
    async fn stream_failure_shuts_the_listener_down() {
        let deliveries = stream::iter(vec![Err::<Delivery, _>(lapin::Error::ChannelsLimitReached)]);

        let state = listen(
            deliveries,
            no_cancel,
            listener(),
            Arc::new(Semaphore::new(1)),
            TaskTracker::new(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, ListenerState::ShutDown);
    }
}

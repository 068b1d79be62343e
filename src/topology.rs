// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module derives the broker objects needed by a subscription and installs them.
//! Planning is pure: a subscription and its consumer group produce an ordered list of
//! declarations and bindings, including the dead-letter retry cycle. Installing runs
//! that list, in order, against a `TopologyChannel`.
//!
//! The main components are:
//! - `TopologyChannel` trait: the declare/bind surface of a broker channel
//! - `TopologyPlan`: ordered operations plus the name of the queue to consume from
//! - Header constants: Constants for RabbitMQ argument and header fields

use crate::{
    builder::InitOperations,
    config::ConsumerConfig,
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDeclaration},
    queue::{Arguments, QueueBinding, QueueDeclaration},
    subscription::{ExchangeSubscription, Subscription, SubscriptionKind},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use tracing::{debug, error};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Name of the queue consuming `exchange` within `consumer_group`.
pub fn main_queue_name(consumer_group: &str, exchange: &str) -> String {
    format!("{}_{}_main_queue", exchange, consumer_group)
}

/// Name of the exchange receiving rejected deliveries.
pub fn dead_letter_start_exchange_name(consumer_group: &str, exchange: &str) -> String {
    format!("{}_{}_error_exchange_start", exchange, consumer_group)
}

/// Name of the exchange receiving deliveries whose delay has expired.
pub fn dead_letter_end_exchange_name(consumer_group: &str, exchange: &str) -> String {
    format!("{}_{}_error_exchange_end", exchange, consumer_group)
}

/// Name of the queue holding rejected deliveries during the delay.
pub fn dead_letter_queue_name(consumer_group: &str, exchange: &str) -> String {
    format!("{}_{}_error_queue", exchange, consumer_group)
}

/// Declare and bind surface of a broker channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopologyChannel: Send + Sync {
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), AmqpError>;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn bind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError>;
}

/// One declaration or binding.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyOperation {
    DeclareExchange(ExchangeDeclaration),
    DeclareQueue(QueueDeclaration),
    BindQueue(QueueBinding),
    BindExchange(ExchangeBinding),
}

/// Ordered operations for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyPlan {
    pub queue: String,
    pub operations: Vec<TopologyOperation>,
}

impl TopologyPlan {
    /// Plans the objects a subscription consumes from.
    ///
    /// Order matters: the error queue references the end exchange, so both cycle
    /// exchanges come first; the main queue must exist before it is bound to the end
    /// exchange.
    pub fn for_subscription(subscription: &Subscription, config: &ConsumerConfig) -> TopologyPlan {
        match &subscription.kind {
            SubscriptionKind::Queue(_) => TopologyPlan {
                queue: subscription.name.clone(),
                operations: vec![TopologyOperation::DeclareQueue(
                    QueueDeclaration::with_defaults(&subscription.name),
                )],
            },
            SubscriptionKind::Exchange(options) => {
                plan_exchange(&subscription.name, options, &config.consumer_group)
            }
        }
    }

    /// Installs the planned operations in order, stopping at the first failure.
    pub async fn install(&self, channel: &dyn TopologyChannel) -> Result<(), AmqpError> {
        install(channel, &self.operations).await
    }
}

fn plan_exchange(exchange: &str, options: &ExchangeSubscription, group: &str) -> TopologyPlan {
    let mut operations = vec![TopologyOperation::DeclareExchange(
        options
            .exchange
            .as_ref()
            .map(|template| template.named_or(exchange))
            .unwrap_or_else(|| ExchangeDeclaration::with_defaults(exchange)),
    )];

    let main_queue_name = options
        .queue
        .as_ref()
        .and_then(|q| q.name.clone())
        .unwrap_or_else(|| main_queue_name(group, exchange));

    let mut main_queue_args = Arguments::new();
    let mut after_main_queue = None;

    if let Some(cycle) = &options.dead_letter {
        let start = exchange_or_default(
            cycle.start_exchange.as_ref(),
            &dead_letter_start_exchange_name(group, exchange),
        );
        let end = exchange_or_default(
            cycle.end_exchange.as_ref(),
            &dead_letter_end_exchange_name(group, exchange),
        );
        let start_name = start.name.clone().unwrap_or_default();
        let end_name = end.name.clone().unwrap_or_default();

        operations.push(TopologyOperation::DeclareExchange(start));
        operations.push(TopologyOperation::DeclareExchange(end));

        let mut error_queue_args = Arguments::new();
        error_queue_args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(cycle.delay.as_millis() as i32)),
        );
        error_queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(end_name.clone())),
        );

        let error_queue_default = dead_letter_queue_name(group, exchange);
        let error_queue = cycle
            .error_queue
            .as_ref()
            .unwrap_or(&QueueDeclaration::with_defaults(&error_queue_default))
            .merged(&error_queue_default, error_queue_args);
        let error_queue_name = error_queue.name.clone().unwrap_or_default();

        operations.push(TopologyOperation::DeclareQueue(error_queue));
        operations.push(TopologyOperation::BindQueue(binding_or_default(
            cycle.error_queue_binding.as_ref(),
            &error_queue_name,
            &start_name,
        )));

        after_main_queue = Some(binding_or_default(
            cycle.main_queue_binding.as_ref(),
            &main_queue_name,
            &end_name,
        ));

        main_queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(start_name)),
        );
    }

    let main_queue = options
        .queue
        .as_ref()
        .unwrap_or(&QueueDeclaration::with_defaults(&main_queue_name))
        .merged(&main_queue_name, main_queue_args);
    operations.push(TopologyOperation::DeclareQueue(main_queue));

    if let Some(binding) = after_main_queue {
        operations.push(TopologyOperation::BindQueue(binding));
    }

    operations.push(TopologyOperation::BindQueue(binding_or_default(
        options.binding.as_ref(),
        &main_queue_name,
        exchange,
    )));

    TopologyPlan {
        queue: main_queue_name,
        operations,
    }
}

fn exchange_or_default(template: Option<&ExchangeDeclaration>, name: &str) -> ExchangeDeclaration {
    template
        .map(|t| t.named_or(name))
        .unwrap_or_else(|| ExchangeDeclaration::with_defaults(name))
}

fn binding_or_default(
    template: Option<&QueueBinding>,
    queue: &str,
    exchange: &str,
) -> QueueBinding {
    template
        .map(|t| t.applied_to(queue, exchange))
        .unwrap_or_else(|| QueueBinding::with_defaults(queue, exchange))
}

/// Orders init-time operations: exchanges, queues, queue bindings, exchange bindings.
pub fn init_operations(operations: &InitOperations) -> Vec<TopologyOperation> {
    operations
        .exchanges
        .iter()
        .cloned()
        .map(TopologyOperation::DeclareExchange)
        .chain(
            operations
                .queues
                .iter()
                .cloned()
                .map(TopologyOperation::DeclareQueue),
        )
        .chain(
            operations
                .queue_bindings
                .iter()
                .cloned()
                .map(TopologyOperation::BindQueue),
        )
        .chain(
            operations
                .exchange_bindings
                .iter()
                .cloned()
                .map(TopologyOperation::BindExchange),
        )
        .collect()
}

/// Runs operations in order against the channel.
pub async fn install(
    channel: &dyn TopologyChannel,
    operations: &[TopologyOperation],
) -> Result<(), AmqpError> {
    for operation in operations {
        match operation {
            TopologyOperation::DeclareExchange(declaration) => {
                channel.declare_exchange(declaration).await?
            }
            TopologyOperation::DeclareQueue(declaration) => {
                channel.declare_queue(declaration).await?
            }
            TopologyOperation::BindQueue(binding) => channel.bind_queue(binding).await?,
            TopologyOperation::BindExchange(binding) => channel.bind_exchange(binding).await?,
        }
    }

    Ok(())
}

fn name_of<'a>(name: &'a Option<String>, what: &str) -> Result<&'a str, AmqpError> {
    name.as_deref()
        .ok_or_else(|| AmqpError::InvalidConfiguration(format!("{} without a name", what)))
}

#[async_trait]
impl TopologyChannel for Channel {
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), AmqpError> {
        let name = name_of(&declaration.name, "exchange")?;
        debug!("creating exchange: {}", name);

        match self
            .exchange_declare(
                name,
                declaration.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: declaration.durable,
                    auto_delete: declaration.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::from(declaration.arguments.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), AmqpError> {
        let name = name_of(&declaration.name, "queue")?;
        debug!("creating queue: {}", name);

        match self
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    nowait: false,
                },
                FieldTable::from(declaration.arguments.clone()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                debug!("queue: {} was created", name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let queue = name_of(&binding.queue, "queue binding")?;
        let exchange = name_of(&binding.exchange, "queue binding")?;
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, binding.routing_key
        );

        match self
            .queue_bind(
                queue,
                exchange,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::from(binding.arguments.clone()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn bind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        debug!(
            "binding exchange: {} to the exchange: {} with the key: {}",
            binding.destination, binding.source, binding.routing_key
        );

        match self
            .exchange_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeBindOptions { nowait: false },
                FieldTable::from(binding.arguments.clone()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind exchange to exchange");
                Err(AmqpError::BindingExchangeError(
                    binding.source.clone(),
                    binding.destination.clone(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::InitOperationsBuilder,
        exchange::{ExchangeBindingBuilder, ExchangeDeclarationBuilder, ExchangeKind},
        queue::{QueueBindingBuilder, QueueDeclarationBuilder},
        subscription::{
            tests::{exchange_subscription, NoopHandler, OrderPlaced},
            DeadLetterCycleBuilder, QueueSubscriptionBuilder,
        },
    };
    use mockall::Sequence;
    use std::time::Duration;

    fn text(value: &str) -> AMQPValue {
        AMQPValue::LongString(LongString::from(value))
    }

    fn group() -> ConsumerConfig {
        ConsumerConfig::new("billing", 4)
    }

    fn queue_at(plan: &TopologyPlan, index: usize) -> &QueueDeclaration {
        match &plan.operations[index] {
            TopologyOperation::DeclareQueue(q) => q,
            other => panic!("expected a queue declaration, got {:?}", other),
        }
    }

    fn binding_at(plan: &TopologyPlan, index: usize) -> &QueueBinding {
        match &plan.operations[index] {
            TopologyOperation::BindQueue(b) => b,
            other => panic!("expected a queue binding, got {:?}", other),
        }
    }

    fn exchange_at(plan: &TopologyPlan, index: usize) -> &ExchangeDeclaration {
        match &plan.operations[index] {
            TopologyOperation::DeclareExchange(e) => e,
            other => panic!("expected an exchange declaration, got {:?}", other),
        }
    }

    #[test]
    fn queue_subscription_declares_its_queue() {
        let subscription =
            QueueSubscriptionBuilder::new::<OrderPlaced, _, _>("jobs", || NoopHandler)
                .build()
                .unwrap();

        let plan = TopologyPlan::for_subscription(&subscription, &group());

        assert_eq!(plan.queue, "jobs");
        assert_eq!(
            plan.operations,
            vec![TopologyOperation::DeclareQueue(QueueDeclaration::with_defaults("jobs"))]
        );
    }

    #[test]
    fn exchange_subscription_without_cycle() {
        let subscription = exchange_subscription("orders").build().unwrap();

        let plan = TopologyPlan::for_subscription(&subscription, &group());

        assert_eq!(plan.queue, "orders_billing_main_queue");
        assert_eq!(
            plan.operations,
            vec![
                TopologyOperation::DeclareExchange(ExchangeDeclaration::with_defaults("orders")),
                TopologyOperation::DeclareQueue(QueueDeclaration::with_defaults(
                    "orders_billing_main_queue"
                )),
                TopologyOperation::BindQueue(QueueBinding::with_defaults(
                    "orders_billing_main_queue",
                    "orders"
                )),
            ]
        );
    }

    #[test]
    fn dead_letter_cycle_names_and_arguments() {
        let subscription = exchange_subscription("orders")
            .dead_letter(DeadLetterCycleBuilder::new().build().unwrap())
            .build()
            .unwrap();

        let plan = TopologyPlan::for_subscription(&subscription, &group());

        assert_eq!(plan.queue, "orders_billing_main_queue");
        assert_eq!(plan.operations.len(), 8);

        assert_eq!(exchange_at(&plan, 0).name(), Some("orders"));
        assert_eq!(exchange_at(&plan, 1).name(), Some("orders_billing_error_exchange_start"));
        assert_eq!(exchange_at(&plan, 2).name(), Some("orders_billing_error_exchange_end"));

        let error_queue = queue_at(&plan, 3);
        assert_eq!(error_queue.name(), Some("orders_billing_error_queue"));
        assert_eq!(
            error_queue.arguments().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(LongInt::from(300_000)))
        );
        assert_eq!(
            error_queue.arguments().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&text("orders_billing_error_exchange_end"))
        );

        assert_eq!(
            binding_at(&plan, 4),
            &QueueBinding::with_defaults(
                "orders_billing_error_queue",
                "orders_billing_error_exchange_start"
            )
        );

        let main_queue = queue_at(&plan, 5);
        assert_eq!(main_queue.name(), Some("orders_billing_main_queue"));
        assert_eq!(
            main_queue.arguments().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&text("orders_billing_error_exchange_start"))
        );

        assert_eq!(
            binding_at(&plan, 6),
            &QueueBinding::with_defaults(
                "orders_billing_main_queue",
                "orders_billing_error_exchange_end"
            )
        );
        assert_eq!(
            binding_at(&plan, 7),
            &QueueBinding::with_defaults("orders_billing_main_queue", "orders")
        );
    }

    #[test]
    fn custom_queue_arguments_win_over_generated_ones() {
        let subscription = exchange_subscription("orders")
            .dead_letter(
                DeadLetterCycleBuilder::new()
                    .delay(Duration::from_secs(2))
                    .error_queue(
                        QueueDeclarationBuilder::unnamed()
                            .argument(
                                AMQP_HEADERS_MESSAGE_TTL,
                                AMQPValue::LongInt(LongInt::from(10)),
                            )
                            .build()
                            .unwrap(),
                    )
                    .build()
                    .unwrap(),
            )
            .queue(
                QueueDeclarationBuilder::unnamed()
                    .argument(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, text("elsewhere"))
                    .argument("x-max-length", AMQPValue::LongInt(LongInt::from(100)))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        let plan = TopologyPlan::for_subscription(&subscription, &group());

        let error_queue = queue_at(&plan, 3);
        assert_eq!(
            error_queue.arguments().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(LongInt::from(10)))
        );
        assert_eq!(
            error_queue.arguments().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&text("orders_billing_error_exchange_end"))
        );

        let main_queue = queue_at(&plan, 5);
        assert_eq!(
            main_queue.arguments().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&text("elsewhere"))
        );
        assert_eq!(main_queue.arguments().len(), 2);
    }

    #[test]
    fn overrides_rename_and_reroute() {
        let subscription = exchange_subscription("orders")
            .exchange(ExchangeDeclarationBuilder::new("ignored").topic().build().unwrap())
            .queue(QueueDeclarationBuilder::new("orders_q").build().unwrap())
            .binding(QueueBindingBuilder::unnamed().routing_key("eu.#").build().unwrap())
            .dead_letter(
                DeadLetterCycleBuilder::new()
                    .start_exchange(ExchangeDeclarationBuilder::new("retry_in").build().unwrap())
                    .main_queue_binding(
                        QueueBindingBuilder::unnamed().routing_key("back").build().unwrap(),
                    )
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        let plan = TopologyPlan::for_subscription(&subscription, &group());

        assert_eq!(plan.queue, "orders_q");
        assert_eq!(exchange_at(&plan, 0).name(), Some("orders"));
        assert_eq!(exchange_at(&plan, 0).kind(), &ExchangeKind::Topic);
        assert_eq!(exchange_at(&plan, 1).name(), Some("retry_in"));
        assert_eq!(binding_at(&plan, 4).exchange.as_deref(), Some("retry_in"));
        assert_eq!(
            queue_at(&plan, 5).arguments().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&text("retry_in"))
        );
        assert_eq!(binding_at(&plan, 6).routing_key(), "back");
        assert_eq!(binding_at(&plan, 7).queue.as_deref(), Some("orders_q"));
        assert_eq!(binding_at(&plan, 7).routing_key(), "eu.#");
    }

    #[test]
    fn init_operations_are_ordered_by_kind() {
        let operations = InitOperationsBuilder::new()
            .bind_exchange(ExchangeBindingBuilder::new("audit", "events").build().unwrap())
            .bind_queue(QueueBindingBuilder::new("jobs", "events").build().unwrap())
            .declare_queue(QueueDeclarationBuilder::new("jobs").build().unwrap())
            .declare_exchange(ExchangeDeclarationBuilder::new("events").build().unwrap())
            .build()
            .unwrap();

        let ordered = init_operations(&operations);

        assert!(matches!(ordered[0], TopologyOperation::DeclareExchange(_)));
        assert!(matches!(ordered[1], TopologyOperation::DeclareQueue(_)));
        assert!(matches!(ordered[2], TopologyOperation::BindQueue(_)));
        assert!(matches!(ordered[3], TopologyOperation::BindExchange(_)));
    }

    #[tokio::test]
    async fn install_runs_operations_in_order() {
        let subscription = exchange_subscription("orders")
            .dead_letter(DeadLetterCycleBuilder::new().build().unwrap())
            .build()
            .unwrap();
        let plan = TopologyPlan::for_subscription(&subscription, &group());

        let mut channel = MockTopologyChannel::new();
        let mut seq = Sequence::new();

        for name in [
            "orders",
            "orders_billing_error_exchange_start",
            "orders_billing_error_exchange_end",
        ] {
            channel
                .expect_declare_exchange()
                .withf(move |d| d.name() == Some(name))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        channel
            .expect_declare_queue()
            .withf(|d| d.name() == Some("orders_billing_error_queue"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|b| b.queue.as_deref() == Some("orders_billing_error_queue"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|d| d.name() == Some("orders_billing_main_queue"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|b| b.exchange.as_deref() == Some("orders_billing_error_exchange_end"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|b| b.exchange.as_deref() == Some("orders"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        assert!(plan.install(&channel).await.is_ok());
    }

    #[tokio::test]
    async fn install_stops_at_first_failure() {
        let subscription = exchange_subscription("orders").build().unwrap();
        let plan = TopologyPlan::for_subscription(&subscription, &group());

        let mut channel = MockTopologyChannel::new();
        channel
            .expect_declare_exchange()
            .times(1)
            .returning(|_| Err(AmqpError::DeclareExchangeError("orders".to_owned())));
        channel.expect_declare_queue().never();
        channel.expect_bind_queue().never();

        assert_eq!(
            plan.install(&channel).await,
            Err(AmqpError::DeclareExchangeError("orders".to_owned()))
        );
    }
}

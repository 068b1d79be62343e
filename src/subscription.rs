// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriptions
//!
//! A subscription ties a broker object (an exchange or a queue) to a message type and
//! its handler. Exchange subscriptions may carry topology overrides and a dead-letter
//! cycle: a delay queue that feeds failed deliveries back into the main queue until
//! the retry budget is spent.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDeclaration,
    handler::{DeliveryExecutor, HandlerExecutor, Message, MessageHandler},
    queue::{require_name, QueueBinding, QueueDeclaration},
};
use std::{any::type_name, fmt, sync::Arc, time::Duration};

/// Default delay before a failed delivery is handled again.
pub const DEFAULT_DEAD_LETTER_DELAY: Duration = Duration::from_secs(5 * 60);
/// Default number of retries granted to a failed delivery.
pub const DEFAULT_DEAD_LETTER_MAX_RETRY_COUNT: u32 = 10;

/// Settings of a dead-letter retry cycle.
///
/// Failed deliveries are rejected into the start exchange, wait `delay` in the error
/// queue, then expire into the end exchange which is bound to the main queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterCycle {
    pub(crate) delay: Duration,
    pub(crate) max_retry_count: u32,
    pub(crate) start_exchange: Option<ExchangeDeclaration>,
    pub(crate) end_exchange: Option<ExchangeDeclaration>,
    pub(crate) error_queue: Option<QueueDeclaration>,
    pub(crate) error_queue_binding: Option<QueueBinding>,
    pub(crate) main_queue_binding: Option<QueueBinding>,
}

impl DeadLetterCycle {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }
}

/// Builder for [`DeadLetterCycle`].
#[derive(Debug, Clone)]
pub struct DeadLetterCycleBuilder {
    delay: Duration,
    max_retry_count: u32,
    start_exchange: Option<ExchangeDeclaration>,
    end_exchange: Option<ExchangeDeclaration>,
    error_queue: Option<QueueDeclaration>,
    error_queue_binding: Option<QueueBinding>,
    main_queue_binding: Option<QueueBinding>,
}

impl Default for DeadLetterCycleBuilder {
    fn default() -> Self {
        DeadLetterCycleBuilder::new()
    }
}

impl DeadLetterCycleBuilder {
    pub fn new() -> DeadLetterCycleBuilder {
        DeadLetterCycleBuilder {
            delay: DEFAULT_DEAD_LETTER_DELAY,
            max_retry_count: DEFAULT_DEAD_LETTER_MAX_RETRY_COUNT,
            start_exchange: None,
            end_exchange: None,
            error_queue: None,
            error_queue_binding: None,
            main_queue_binding: None,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    /// Overrides the exchange receiving rejected deliveries.
    pub fn start_exchange(mut self, declaration: ExchangeDeclaration) -> Self {
        self.start_exchange = Some(declaration);
        self
    }

    /// Overrides the exchange receiving expired deliveries from the error queue.
    pub fn end_exchange(mut self, declaration: ExchangeDeclaration) -> Self {
        self.end_exchange = Some(declaration);
        self
    }

    /// Overrides the error (delay) queue.
    pub fn error_queue(mut self, declaration: QueueDeclaration) -> Self {
        self.error_queue = Some(declaration);
        self
    }

    /// Overrides the binding between the error queue and the start exchange.
    pub fn error_queue_binding(mut self, binding: QueueBinding) -> Self {
        self.error_queue_binding = Some(binding);
        self
    }

    /// Overrides the binding between the main queue and the end exchange.
    pub fn main_queue_binding(mut self, binding: QueueBinding) -> Self {
        self.main_queue_binding = Some(binding);
        self
    }

    /// # Returns
    /// The cycle, or `InvalidConfiguration` when the delay or the retry count is out
    /// of range
    pub fn build(self) -> Result<DeadLetterCycle, AmqpError> {
        if self.delay.is_zero() {
            return Err(AmqpError::InvalidConfiguration(
                "dead letter delay must be greater than 0".to_owned(),
            ));
        }

        if self.delay.as_millis() > i32::MAX as u128 {
            return Err(AmqpError::InvalidConfiguration(
                "dead letter delay does not fit a queue ttl".to_owned(),
            ));
        }

        if self.max_retry_count < 1 {
            return Err(AmqpError::InvalidConfiguration(
                "dead letter max retry count must be at least 1".to_owned(),
            ));
        }

        Ok(DeadLetterCycle {
            delay: self.delay,
            max_retry_count: self.max_retry_count,
            start_exchange: self.start_exchange,
            end_exchange: self.end_exchange,
            error_queue: self.error_queue,
            error_queue_binding: self.error_queue_binding,
            main_queue_binding: self.main_queue_binding,
        })
    }
}

/// Consumption from an exchange through a queue owned by the consumer group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeSubscription {
    pub(crate) exchange: Option<ExchangeDeclaration>,
    pub(crate) queue: Option<QueueDeclaration>,
    pub(crate) binding: Option<QueueBinding>,
    pub(crate) dead_letter: Option<DeadLetterCycle>,
}

/// Consumption straight from a named queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSubscription {}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionKind {
    Exchange(ExchangeSubscription),
    Queue(QueueSubscription),
}

/// A validated subscription, ready to be started by the consumer host.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) name: String,
    pub(crate) message_type: &'static str,
    pub(crate) handler_type: &'static str,
    pub(crate) max_degree_of_parallelism: u16,
    pub(crate) kind: SubscriptionKind,
    pub(crate) executor: Arc<dyn DeliveryExecutor>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn handler_type(&self) -> &'static str {
        self.handler_type
    }

    pub fn max_degree_of_parallelism(&self) -> u16 {
        self.max_degree_of_parallelism
    }

    pub fn kind(&self) -> &SubscriptionKind {
        &self.kind
    }

    /// The dead-letter cycle; only exchange subscriptions can have one.
    pub fn dead_letter(&self) -> Option<&DeadLetterCycle> {
        match &self.kind {
            SubscriptionKind::Exchange(exchange) => exchange.dead_letter.as_ref(),
            SubscriptionKind::Queue(_) => None,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("message_type", &self.message_type)
            .field("handler_type", &self.handler_type)
            .field("max_degree_of_parallelism", &self.max_degree_of_parallelism)
            .field("kind", &self.kind)
            .finish()
    }
}

struct Registration {
    name: String,
    message_type: &'static str,
    handler_type: &'static str,
    executor: Arc<dyn DeliveryExecutor>,
}

impl Registration {
    fn new<M, H, F>(name: &str, factory: F) -> Registration
    where
        M: Message,
        H: MessageHandler<M> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        Registration {
            name: name.to_owned(),
            message_type: type_name::<M>(),
            handler_type: type_name::<H>(),
            executor: HandlerExecutor::<M, H, F>::new(factory),
        }
    }

    fn into_subscription(
        self,
        max_degree_of_parallelism: u16,
        kind: SubscriptionKind,
    ) -> Result<Subscription, AmqpError> {
        require_name("subscription name", &self.name)?;

        if max_degree_of_parallelism < 1 {
            return Err(AmqpError::InvalidConfiguration(
                "the max degree of parallelism cannot be less than 1".to_owned(),
            ));
        }

        Ok(Subscription {
            name: self.name,
            message_type: self.message_type,
            handler_type: self.handler_type,
            max_degree_of_parallelism,
            kind,
            executor: self.executor,
        })
    }
}

/// Builder for an exchange subscription.
pub struct ExchangeSubscriptionBuilder {
    registration: Registration,
    max_degree_of_parallelism: u16,
    options: ExchangeSubscription,
}

impl ExchangeSubscriptionBuilder {
    /// Subscribes to the exchange `name`; `factory` produces one handler per delivery.
    pub fn new<M, H, F>(name: &str, factory: F) -> ExchangeSubscriptionBuilder
    where
        M: Message,
        H: MessageHandler<M> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        ExchangeSubscriptionBuilder {
            registration: Registration::new::<M, H, F>(name, factory),
            max_degree_of_parallelism: 1,
            options: ExchangeSubscription::default(),
        }
    }

    pub fn max_degree_of_parallelism(mut self, degree: u16) -> Self {
        self.max_degree_of_parallelism = degree;
        self
    }

    pub fn dead_letter(mut self, cycle: DeadLetterCycle) -> Self {
        self.options.dead_letter = Some(cycle);
        self
    }

    /// Overrides the declaration of the subscribed exchange. Its name is ignored.
    pub fn exchange(mut self, declaration: ExchangeDeclaration) -> Self {
        self.options.exchange = Some(declaration);
        self
    }

    /// Overrides the main queue. A named declaration replaces the generated name.
    pub fn queue(mut self, declaration: QueueDeclaration) -> Self {
        self.options.queue = Some(declaration);
        self
    }

    /// Overrides the binding between the main queue and the subscribed exchange.
    pub fn binding(mut self, binding: QueueBinding) -> Self {
        self.options.binding = Some(binding);
        self
    }

    pub fn build(self) -> Result<Subscription, AmqpError> {
        let mut options = self.options;
        if let Some(exchange) = options.exchange.as_mut() {
            exchange.name = None;
        }

        self.registration.into_subscription(
            self.max_degree_of_parallelism,
            SubscriptionKind::Exchange(options),
        )
    }
}

/// Builder for a queue subscription.
pub struct QueueSubscriptionBuilder {
    registration: Registration,
    max_degree_of_parallelism: u16,
}

impl QueueSubscriptionBuilder {
    /// Subscribes to the queue `name`; `factory` produces one handler per delivery.
    pub fn new<M, H, F>(name: &str, factory: F) -> QueueSubscriptionBuilder
    where
        M: Message,
        H: MessageHandler<M> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        QueueSubscriptionBuilder {
            registration: Registration::new::<M, H, F>(name, factory),
            max_degree_of_parallelism: 1,
        }
    }

    pub fn max_degree_of_parallelism(mut self, degree: u16) -> Self {
        self.max_degree_of_parallelism = degree;
        self
    }

    pub fn build(self) -> Result<Subscription, AmqpError> {
        self.registration.into_subscription(
            self.max_degree_of_parallelism,
            SubscriptionKind::Queue(QueueSubscription::default()),
        )
    }
}

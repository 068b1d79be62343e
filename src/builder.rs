// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Relay Builders
//!
//! Staged configuration of the relay: instances, their consumer and producer roles,
//! and the topology operations run once a connection is established. Every `build()`
//! validates eagerly so that an invalid configuration fails before any network I/O.

use crate::{
    config::{ConnectionConfig, ConsumerConfig, ProducerConfig},
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDeclaration},
    queue::{require_name, QueueBinding, QueueDeclaration},
    subscription::Subscription,
};
use std::collections::HashSet;

/// Name used by instances added without an explicit name.
pub const DEFAULT_INSTANCE_NAME: &str = "Default";

/// Validated consumer role of an instance.
#[derive(Debug, Clone)]
pub struct ConsumerBuildResult {
    pub(crate) config: ConsumerConfig,
    pub(crate) subscriptions: Vec<Subscription>,
}

impl ConsumerBuildResult {
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }
}

/// Collects the subscriptions of an instance.
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    subscriptions: Vec<Result<Subscription, AmqpError>>,
}

impl ConsumerBuilder {
    pub fn new(config: ConsumerConfig) -> ConsumerBuilder {
        ConsumerBuilder {
            config,
            subscriptions: vec![],
        }
    }

    /// Adds a subscription, as returned by an exchange or queue subscription builder.
    pub fn subscribe(mut self, subscription: Result<Subscription, AmqpError>) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Validates the settings and every subscription.
    ///
    /// # Returns
    /// The consumer, the first subscription error, or `InvalidConfiguration` when a
    /// subscription asks for more parallelism than the consumer allows
    pub fn build(self) -> Result<ConsumerBuildResult, AmqpError> {
        self.config.validate()?;

        let mut subscriptions = Vec::with_capacity(self.subscriptions.len());
        for subscription in self.subscriptions {
            let subscription = subscription?;

            if subscription.max_degree_of_parallelism > self.config.max_degree_of_parallelism {
                return Err(AmqpError::InvalidConfiguration(format!(
                    "the max degree of parallelism of subscription `{}` ({}) exceeds \
                     the consumer max degree of parallelism ({})",
                    subscription.name,
                    subscription.max_degree_of_parallelism,
                    self.config.max_degree_of_parallelism
                )));
            }

            subscriptions.push(subscription);
        }

        Ok(ConsumerBuildResult {
            config: self.config,
            subscriptions,
        })
    }
}

/// Validated producer role of an instance.
#[derive(Debug, Clone)]
pub struct ProducerBuildResult {
    pub(crate) config: ProducerConfig,
}

impl ProducerBuildResult {
    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }
}

/// Topology operations executed once, right after the instance connects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitOperations {
    pub(crate) exchanges: Vec<ExchangeDeclaration>,
    pub(crate) queues: Vec<QueueDeclaration>,
    pub(crate) queue_bindings: Vec<QueueBinding>,
    pub(crate) exchange_bindings: Vec<ExchangeBinding>,
}

impl InitOperations {
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
            && self.queues.is_empty()
            && self.queue_bindings.is_empty()
            && self.exchange_bindings.is_empty()
    }
}

/// Builder for [`InitOperations`]. Every operation must name its objects explicitly.
#[derive(Debug, Default)]
pub struct InitOperationsBuilder {
    operations: InitOperations,
}

impl InitOperationsBuilder {
    pub fn new() -> InitOperationsBuilder {
        InitOperationsBuilder::default()
    }

    pub fn declare_exchange(mut self, declaration: ExchangeDeclaration) -> Self {
        self.operations.exchanges.push(declaration);
        self
    }

    pub fn declare_queue(mut self, declaration: QueueDeclaration) -> Self {
        self.operations.queues.push(declaration);
        self
    }

    pub fn bind_queue(mut self, binding: QueueBinding) -> Self {
        self.operations.queue_bindings.push(binding);
        self
    }

    pub fn bind_exchange(mut self, binding: ExchangeBinding) -> Self {
        self.operations.exchange_bindings.push(binding);
        self
    }

    pub fn build(self) -> Result<InitOperations, AmqpError> {
        let ops = &self.operations;

        if ops.exchanges.iter().any(|e| e.name.is_none()) {
            return Err(AmqpError::InvalidConfiguration(
                "an init exchange declaration must be named".to_owned(),
            ));
        }

        if ops.queues.iter().any(|q| q.name.is_none()) {
            return Err(AmqpError::InvalidConfiguration(
                "an init queue declaration must be named".to_owned(),
            ));
        }

        if ops
            .queue_bindings
            .iter()
            .any(|b| b.queue.is_none() || b.exchange.is_none())
        {
            return Err(AmqpError::InvalidConfiguration(
                "an init queue binding must name its queue and exchange".to_owned(),
            ));
        }

        Ok(self.operations)
    }
}

/// Validated configuration of one broker instance.
#[derive(Debug, Clone)]
pub struct InstanceBuildResult {
    pub(crate) name: String,
    pub(crate) connection: ConnectionConfig,
    pub(crate) consumer: Option<ConsumerBuildResult>,
    pub(crate) producer: Option<ProducerBuildResult>,
    pub(crate) init_operations: Option<InitOperations>,
}

impl InstanceBuildResult {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn consumer(&self) -> Option<&ConsumerBuildResult> {
        self.consumer.as_ref()
    }

    pub fn producer(&self) -> Option<&ProducerBuildResult> {
        self.producer.as_ref()
    }

    pub fn init_operations(&self) -> Option<&InitOperations> {
        self.init_operations.as_ref()
    }

    /// Concurrency of the consumer dispatch of this instance.
    pub fn dispatch_concurrency(&self) -> u16 {
        self.consumer
            .as_ref()
            .map(|c| c.config.max_degree_of_parallelism)
            .unwrap_or(1)
    }
}

/// Builder for [`InstanceBuildResult`].
pub struct InstanceBuilder {
    name: String,
    connection: ConnectionConfig,
    consumer: Option<Result<ConsumerBuildResult, AmqpError>>,
    producer: Option<ProducerConfig>,
    init_operations: Option<Result<InitOperations, AmqpError>>,
}

impl InstanceBuilder {
    pub fn new(name: &str, connection: ConnectionConfig) -> InstanceBuilder {
        InstanceBuilder {
            name: name.to_owned(),
            connection,
            consumer: None,
            producer: None,
            init_operations: None,
        }
    }

    /// Instance named [`DEFAULT_INSTANCE_NAME`].
    pub fn default_instance(connection: ConnectionConfig) -> InstanceBuilder {
        InstanceBuilder::new(DEFAULT_INSTANCE_NAME, connection)
    }

    /// This instance consumes the subscriptions collected by `consumer`.
    pub fn consumer(mut self, consumer: ConsumerBuilder) -> Self {
        self.consumer = Some(consumer.build());
        self
    }

    /// This instance can publish messages.
    pub fn producer(mut self, config: ProducerConfig) -> Self {
        self.producer = Some(config);
        self
    }

    /// Topology declared as soon as the instance connects.
    pub fn init_operations(mut self, operations: InitOperationsBuilder) -> Self {
        self.init_operations = Some(operations.build());
        self
    }

    /// # Returns
    /// The validated instance, or the first error of its name, connection, consumer,
    /// producer or init operations
    pub fn build(self) -> Result<InstanceBuildResult, AmqpError> {
        require_name("instance name", &self.name)?;
        self.connection.validate()?;

        let consumer = self.consumer.transpose()?;
        let producer = match self.producer {
            Some(config) => {
                config.validate()?;
                Some(ProducerBuildResult { config })
            }
            None => None,
        };

        if consumer.is_none() && producer.is_none() {
            return Err(AmqpError::InvalidConfiguration(format!(
                "instance `{}` must be configured as a consumer, a producer or both",
                self.name
            )));
        }

        Ok(InstanceBuildResult {
            name: self.name,
            connection: self.connection,
            consumer,
            producer,
            init_operations: self.init_operations.transpose()?,
        })
    }
}

/// Validated configuration of every instance.
#[derive(Debug, Clone)]
pub struct RelayBuildResult {
    pub(crate) instances: Vec<InstanceBuildResult>,
}

impl RelayBuildResult {
    pub fn instances(&self) -> &[InstanceBuildResult] {
        &self.instances
    }

    pub fn instance(&self, name: &str) -> Option<&InstanceBuildResult> {
        self.instances.iter().find(|i| i.name == name)
    }
}

/// Top-level builder collecting every instance.
#[derive(Default)]
pub struct RelayBuilder {
    instances: Vec<InstanceBuilder>,
}

impl RelayBuilder {
    pub fn new() -> RelayBuilder {
        RelayBuilder::default()
    }

    pub fn instance(mut self, instance: InstanceBuilder) -> Self {
        self.instances.push(instance);
        self
    }

    /// Builds every instance and checks their names are unique.
    pub fn build(self) -> Result<RelayBuildResult, AmqpError> {
        let mut names = HashSet::new();
        let mut instances = Vec::with_capacity(self.instances.len());

        for builder in self.instances {
            let instance = builder.build()?;

            if !names.insert(instance.name.clone()) {
                return Err(AmqpError::InvalidConfiguration(format!(
                    "instance name `{}` is used more than once",
                    instance.name
                )));
            }

            instances.push(instance);
        }

        Ok(RelayBuildResult { instances })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exchange::ExchangeDeclarationBuilder,
        queue::{QueueBindingBuilder, QueueDeclarationBuilder},
        subscription::tests::exchange_subscription,
    };

    fn consumer(max: u16, subscription_max: u16) -> ConsumerBuilder {
        ConsumerBuilder::new(ConsumerConfig::new("billing", max)).subscribe(
            exchange_subscription("orders")
                .max_degree_of_parallelism(subscription_max)
                .build(),
        )
    }

    #[test]
    fn subscription_parallelism_cannot_exceed_ceiling() {
        assert!(matches!(
            consumer(2, 3).build(),
            Err(AmqpError::InvalidConfiguration(_))
        ));
        assert!(consumer(3, 3).build().is_ok());
        assert!(consumer(5, 1).build().is_ok());
    }

    #[test]
    fn instance_requires_a_role() {
        let result = InstanceBuilder::new("main", ConnectionConfig::default()).build();
        assert!(matches!(result, Err(AmqpError::InvalidConfiguration(_))));

        let producer_only = InstanceBuilder::new("main", ConnectionConfig::default())
            .producer(ProducerConfig::new(2))
            .build()
            .unwrap();
        assert_eq!(producer_only.dispatch_concurrency(), 1);
    }

    #[test]
    fn instance_validates_connection_fields() {
        let mut connection = ConnectionConfig::default();
        connection.user = String::new();

        let result = InstanceBuilder::new("main", connection)
            .producer(ProducerConfig::new(1))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn instance_surfaces_consumer_errors() {
        let result = InstanceBuilder::default_instance(ConnectionConfig::default())
            .consumer(consumer(1, 2))
            .build();
        assert!(result.is_err());

        let instance = InstanceBuilder::default_instance(ConnectionConfig::default())
            .consumer(consumer(4, 2))
            .build()
            .unwrap();
        assert_eq!(instance.name(), DEFAULT_INSTANCE_NAME);
        assert_eq!(instance.dispatch_concurrency(), 4);
    }

    #[test]
    fn instance_names_must_be_unique() {
        let instance = |name: &str| {
            InstanceBuilder::new(name, ConnectionConfig::default()).producer(ProducerConfig::new(1))
        };

        let duplicated = RelayBuilder::new()
            .instance(instance("a"))
            .instance(instance("a"))
            .build();
        assert!(matches!(duplicated, Err(AmqpError::InvalidConfiguration(_))));

        let distinct = RelayBuilder::new()
            .instance(instance("a"))
            .instance(instance("b"))
            .build()
            .unwrap();
        assert_eq!(distinct.instances().len(), 2);
        assert!(distinct.instance("b").is_some());
    }

    #[test]
    fn init_operations_require_names() {
        let unnamed = InitOperationsBuilder::new()
            .declare_exchange(ExchangeDeclarationBuilder::unnamed().build().unwrap())
            .build();
        assert!(unnamed.is_err());

        let unbound = InitOperationsBuilder::new()
            .bind_queue(QueueBindingBuilder::unnamed().build().unwrap())
            .build();
        assert!(unbound.is_err());

        let operations = InitOperationsBuilder::new()
            .declare_exchange(ExchangeDeclarationBuilder::new("events").build().unwrap())
            .declare_queue(QueueDeclarationBuilder::new("jobs").build().unwrap())
            .bind_queue(QueueBindingBuilder::new("jobs", "events").build().unwrap())
            .build()
            .unwrap();
        assert!(!operations.is_empty());
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! This module provides types for describing queues and queue-to-exchange bindings,
//! together with the argument map shared by every declaration. Declarations serve
//! both as explicit init-time operations and as override templates merged with the
//! values the relay computes for a subscription.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, ShortString};
use std::collections::BTreeMap;

/// Arguments of a declaration or binding (`x-message-ttl`, `x-dead-letter-exchange`...).
pub type Arguments = BTreeMap<ShortString, AMQPValue>;

/// Merges custom arguments over generated ones.
///
/// On a key collision the custom value wins; generated keys absent from `custom` are kept.
pub fn merge_arguments(generated: Arguments, custom: &Arguments) -> Arguments {
    let mut merged = generated;
    merged.extend(custom.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

pub(crate) fn require_name(field: &str, value: &str) -> Result<(), AmqpError> {
    if value.trim().is_empty() {
        return Err(AmqpError::InvalidConfiguration(format!(
            "the {} must be specified",
            field
        )));
    }

    Ok(())
}

/// Declaration of a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclaration {
    pub(crate) name: Option<String>,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) arguments: Arguments,
}

impl QueueDeclaration {
    /// Durable, not exclusive, not auto-deleted, without arguments.
    pub(crate) fn with_defaults(name: &str) -> QueueDeclaration {
        QueueDeclaration {
            name: Some(name.to_owned()),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Arguments::default(),
        }
    }

    /// Applies this template to the queue `name` with the `generated` arguments.
    ///
    /// A name carried by the template takes precedence over `name`.
    pub(crate) fn merged(&self, name: &str, generated: Arguments) -> QueueDeclaration {
        QueueDeclaration {
            name: Some(self.name.clone().unwrap_or_else(|| name.to_owned())),
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            arguments: merge_arguments(generated, &self.arguments),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }
}

/// Builder for [`QueueDeclaration`].
#[derive(Debug, Clone)]
pub struct QueueDeclarationBuilder {
    name: Option<String>,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    arguments: Arguments,
}

impl QueueDeclarationBuilder {
    /// Starts a declaration of the queue `name`.
    ///
    /// Defaults: durable, not exclusive, not auto-deleted, no arguments.
    pub fn new(name: &str) -> QueueDeclarationBuilder {
        QueueDeclarationBuilder {
            name: Some(name.to_owned()),
            ..QueueDeclarationBuilder::unnamed()
        }
    }

    /// Starts an override template whose name comes from where it is used.
    pub fn unnamed() -> QueueDeclarationBuilder {
        QueueDeclarationBuilder {
            name: None,
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Arguments::default(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Replaces the whole argument map.
    pub fn arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    /// Adds a single argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    pub fn build(self) -> Result<QueueDeclaration, AmqpError> {
        if let Some(name) = &self.name {
            require_name("queue name", name)?;
        }

        Ok(QueueDeclaration {
            name: self.name,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            arguments: self.arguments,
        })
    }
}

/// Binding of a queue to an exchange.
///
/// Both names are absent for override templates, which only carry the routing key
/// and arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue: Option<String>,
    pub(crate) exchange: Option<String>,
    pub(crate) routing_key: String,
    pub(crate) arguments: Arguments,
}

impl QueueBinding {
    pub(crate) fn with_defaults(queue: &str, exchange: &str) -> QueueBinding {
        QueueBinding {
            queue: Some(queue.to_owned()),
            exchange: Some(exchange.to_owned()),
            routing_key: String::new(),
            arguments: Arguments::default(),
        }
    }

    /// Applies the routing key and arguments of this template to `queue` and `exchange`.
    pub(crate) fn applied_to(&self, queue: &str, exchange: &str) -> QueueBinding {
        QueueBinding {
            queue: Some(queue.to_owned()),
            exchange: Some(exchange.to_owned()),
            routing_key: self.routing_key.clone(),
            arguments: self.arguments.clone(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

/// Builder for [`QueueBinding`].
#[derive(Debug, Clone)]
pub struct QueueBindingBuilder {
    queue: Option<String>,
    exchange: Option<String>,
    routing_key: String,
    arguments: Arguments,
}

impl QueueBindingBuilder {
    /// Binds `queue` to `exchange`. The routing key defaults to the empty string.
    pub fn new(queue: &str, exchange: &str) -> QueueBindingBuilder {
        QueueBindingBuilder {
            queue: Some(queue.to_owned()),
            exchange: Some(exchange.to_owned()),
            routing_key: String::new(),
            arguments: Arguments::default(),
        }
    }

    /// Starts an override template for a binding computed by the relay.
    pub fn unnamed() -> QueueBindingBuilder {
        QueueBindingBuilder {
            queue: None,
            exchange: None,
            routing_key: String::new(),
            arguments: Arguments::default(),
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn build(self) -> Result<QueueBinding, AmqpError> {
        if let Some(queue) = &self.queue {
            require_name("queue name", queue)?;
        }

        if let Some(exchange) = &self.exchange {
            require_name("exchange name", exchange)?;
        }

        Ok(QueueBinding {
            queue: self.queue,
            exchange: self.exchange,
            routing_key: self.routing_key,
            arguments: self.arguments,
        })
    }
}

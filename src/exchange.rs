// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! This module provides types for describing exchanges and exchange-to-exchange
//! bindings. Exchanges are the routing mechanism that decides how published messages
//! are distributed to queues. Declarations are built with a consuming builder and
//! validated by `build()`, after which they are immutable.

use crate::{
    errors::AmqpError,
    queue::{require_name, Arguments},
};
use lapin::types::{AMQPValue, ShortString};

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - Custom: Plugin provided exchange types, such as `x-delayed-message`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    #[default]
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind),
        }
    }
}

/// Declaration of an exchange.
///
/// The name is absent only for override templates, whose name is inferred from the
/// subscription they are attached to.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDeclaration {
    pub(crate) name: Option<String>,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) arguments: Arguments,
}

impl ExchangeDeclaration {
    /// Fanout, durable, not auto-deleted, without arguments.
    pub(crate) fn with_defaults(name: &str) -> ExchangeDeclaration {
        ExchangeDeclaration {
            name: Some(name.to_owned()),
            kind: ExchangeKind::Fanout,
            durable: true,
            auto_delete: false,
            arguments: Arguments::default(),
        }
    }

    /// Uses this declaration as a template for an exchange named `name`, unless the
    /// template carries its own name.
    pub(crate) fn named_or(&self, name: &str) -> ExchangeDeclaration {
        let mut declaration = self.clone();
        if declaration.name.is_none() {
            declaration.name = Some(name.to_owned());
        }
        declaration
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }
}

/// Builder for [`ExchangeDeclaration`].
#[derive(Debug, Clone)]
pub struct ExchangeDeclarationBuilder {
    name: Option<String>,
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
    arguments: Arguments,
}

impl ExchangeDeclarationBuilder {
    /// Starts a declaration of the exchange `name`.
    ///
    /// Defaults: fanout, durable, not auto-deleted, no arguments.
    pub fn new(name: &str) -> ExchangeDeclarationBuilder {
        ExchangeDeclarationBuilder {
            name: Some(name.to_owned()),
            ..ExchangeDeclarationBuilder::unnamed()
        }
    }

    /// Starts an override template whose name comes from where it is used.
    pub fn unnamed() -> ExchangeDeclarationBuilder {
        ExchangeDeclarationBuilder {
            name: None,
            kind: ExchangeKind::Fanout,
            durable: true,
            auto_delete: false,
            arguments: Arguments::default(),
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
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

    pub fn build(self) -> Result<ExchangeDeclaration, AmqpError> {
        if let Some(name) = &self.name {
            require_name("exchange name", name)?;
        }

        if let ExchangeKind::Custom(kind) = &self.kind {
            require_name("exchange type", kind)?;
        }

        Ok(ExchangeDeclaration {
            name: self.name,
            kind: self.kind,
            durable: self.durable,
            auto_delete: self.auto_delete,
            arguments: self.arguments,
        })
    }
}

/// Binding of a destination exchange to a source exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeBinding {
    pub(crate) destination: String,
    pub(crate) source: String,
    pub(crate) routing_key: String,
    pub(crate) arguments: Arguments,
}

/// Builder for [`ExchangeBinding`].
#[derive(Debug, Clone)]
pub struct ExchangeBindingBuilder {
    destination: String,
    source: String,
    routing_key: String,
    arguments: Arguments,
}

impl ExchangeBindingBuilder {
    /// Routes messages published to `source` into `destination`.
    pub fn new(destination: &str, source: &str) -> ExchangeBindingBuilder {
        ExchangeBindingBuilder {
            destination: destination.to_owned(),
            source: source.to_owned(),
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

    pub fn build(self) -> Result<ExchangeBinding, AmqpError> {
        require_name("destination exchange", &self.destination)?;
        require_name("source exchange", &self.source)?;

        Ok(ExchangeBinding {
            destination: self.destination,
            source: self.source,
            routing_key: self.routing_key,
            arguments: self.arguments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn exchange_declaration_defaults() {
        let declaration = ExchangeDeclarationBuilder::new("orders").build().unwrap();

        assert_eq!(declaration.name(), Some("orders"));
        assert_eq!(declaration.kind, ExchangeKind::Fanout);
        assert!(declaration.durable);
        assert!(!declaration.auto_delete);
        assert!(declaration.arguments.is_empty());
        assert_eq!(declaration, ExchangeDeclaration::with_defaults("orders"));
    }

    #[test]
    fn exchange_declaration_requires_non_empty_name() {
        assert!(matches!(
            ExchangeDeclarationBuilder::new("").build(),
            Err(AmqpError::InvalidConfiguration(_))
        ));
        assert!(ExchangeDeclarationBuilder::unnamed().build().is_ok());
    }

    #[test]
    fn template_takes_inferred_name_only_when_unnamed() {
        let template = ExchangeDeclarationBuilder::unnamed()
            .topic()
            .argument("alternate-exchange", AMQPValue::LongString(LongString::from("ae")))
            .build()
            .unwrap();

        let declaration = template.named_or("orders");
        assert_eq!(declaration.name(), Some("orders"));
        assert_eq!(declaration.kind, ExchangeKind::Topic);
        assert_eq!(declaration.arguments.len(), 1);

        let named = ExchangeDeclarationBuilder::new("custom").build().unwrap();
        assert_eq!(named.named_or("orders").name(), Some("custom"));
    }

    #[test]
    fn exchange_binding_requires_both_sides() {
        assert!(ExchangeBindingBuilder::new("a", "b").build().is_ok());
        assert!(ExchangeBindingBuilder::new("", "b").build().is_err());
        assert!(ExchangeBindingBuilder::new("a", "").build().is_err());
    }

    #[test]
    fn custom_kind_maps_to_lapin() {
        let kind: lapin::ExchangeKind = ExchangeKind::Custom("x-delayed-message".to_owned()).into();
        assert!(matches!(kind, lapin::ExchangeKind::Custom(name) if name == "x-delayed-message"));
    }
}

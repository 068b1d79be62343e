// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Relay
//!
//! This module provides the error taxonomy shared by every component of the relay.
//! The `AmqpError` enum covers configuration, connectivity, topology, consuming and
//! publishing failures. Handler failures use the boxed `HandlerError` instead, since
//! they come from application code.

use thiserror::Error;

/// Error returned by message handlers.
///
/// Payload decoding failures are converted into this type as well, so both follow
/// the same dead-letter retry path.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during relay operations.
///
/// Configuration errors are raised while building, before any network activity.
/// Connectivity and topology errors are raised at startup. Ack/nack and publishing
/// errors are raised in steady state and are logged rather than propagated.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// A configuration value or combination is invalid
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The broker could not be reached, even after every reconnect attempt
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// The component was used after being disposed
    #[error("already disposed")]
    AlreadyDisposed,

    /// No instance (or no producer for the instance) is registered under the name
    #[error("unknown instance `{0}`")]
    UnknownInstance(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding an exchange to another exchange
    #[error("failure to binding exchange `{0}` to exchange `{1}`")]
    BindingExchangeError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}

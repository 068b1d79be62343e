// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Relay
//!
//! Typed publish/subscribe over RabbitMQ. Subscriptions declare their own topology,
//! failed deliveries are retried through a delayed dead-letter cycle, and publishing
//! shares a bounded pool of channels per broker instance.

mod codec;
mod consumer;
mod otel;

pub mod builder;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod subscription;
pub mod topology;

pub use codec::JSON_CONTENT_TYPE;
pub use consumer::{AMQP_HEADERS_COUNT, AMQP_HEADERS_X_DEATH};

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Registry
//!
//! Composition root of the relay. It owns the connection holder, the publisher with its
//! channel pools, and the consumer host, from startup to shutdown.
//!
//! ```no_run
//! use amqp_relay::{
//!     builder::{ConsumerBuilder, InstanceBuilder, RelayBuilder},
//!     config::{ConnectionConfig, ConsumerConfig, ProducerConfig},
//!     errors::HandlerError,
//!     handler::MessageHandler,
//!     registry::Registry,
//!     subscription::{DeadLetterCycleBuilder, ExchangeSubscriptionBuilder},
//! };
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     id: u64,
//! }
//!
//! struct Billing;
//!
//! #[async_trait]
//! impl MessageHandler<OrderPlaced> for Billing {
//!     async fn handle(&self, _: OrderPlaced, _: CancellationToken) -> Result<(), HandlerError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), amqp_relay::errors::AmqpError> {
//! let relay = RelayBuilder::new()
//!     .instance(
//!         InstanceBuilder::default_instance(ConnectionConfig::default())
//!             .producer(ProducerConfig::new(4))
//!             .consumer(
//!                 ConsumerBuilder::new(ConsumerConfig::new("billing", 8)).subscribe(
//!                     ExchangeSubscriptionBuilder::new::<OrderPlaced, _, _>("orders", || Billing)
//!                         .dead_letter(DeadLetterCycleBuilder::new().build()?)
//!                         .build(),
//!                 ),
//!             ),
//!     )
//!     .build()?;
//!
//! let registry = Registry::new(relay)?;
//! registry.start().await?;
//! registry.publisher().publish(&OrderPlaced { id: 1 }, "orders").await?;
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    builder::RelayBuildResult,
    connection::ConnectionHolder,
    dispatcher::ConsumerHost,
    errors::AmqpError,
    publisher::{Publisher, ReadySignal},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Registry {
    relay: RelayBuildResult,
    holder: Arc<ConnectionHolder>,
    publisher: Arc<Publisher>,
    consumers: ConsumerHost,
    ready: ReadySignal,
    cancellation: CancellationToken,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl Registry {
    /// Prepares the relay. No connection is opened until [`Registry::start`] or the
    /// first publish.
    pub fn new(relay: RelayBuildResult) -> Result<Registry, AmqpError> {
        let holder = Arc::new(ConnectionHolder::new());
        let ready = ReadySignal::new();
        let publisher = Publisher::new(&relay.instances, holder.clone(), ready.clone())?;

        // without consumers there is no topology to wait for
        if relay.instances.iter().all(|i| i.consumer().is_none()) {
            ready.fire();
        }

        Ok(Registry {
            consumers: ConsumerHost::new(holder.clone(), ready.clone()),
            relay,
            holder,
            publisher: Arc::new(publisher),
            ready,
            cancellation: CancellationToken::new(),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    /// Fires once every consumer finished its setup pass.
    pub fn ready(&self) -> ReadySignal {
        self.ready.clone()
    }

    /// Token cancelled on shutdown, handed to every handler.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Declares the consumer topology and starts every listener.
    ///
    /// Setup failures of an instance or a subscription are logged and skipped, so this
    /// only fails when the registry was already started or shut down.
    pub async fn start(&self) -> Result<(), AmqpError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AmqpError::AlreadyDisposed);
        }

        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::InvalidConfiguration(
                "the registry is already started".to_owned(),
            ));
        }

        let listeners = self
            .consumers
            .start(&self.relay.instances, &self.cancellation)
            .await;

        info!(
            instances = self.relay.instances.len(),
            listeners = listeners,
            "relay started"
        );
        Ok(())
    }

    /// Cancels every listener, lets in-flight deliveries finish, then closes every
    /// channel and connection.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyDisposed);
        }

        self.cancellation.cancel();
        self.consumers.stopped().await;
        self.publisher.close().await;
        self.holder.dispose().await?;

        info!("relay stopped");
        Ok(())
    }
}

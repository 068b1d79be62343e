// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the physical connections of every instance. A connection is
//! created lazily, exactly once per instance name, retrying while the broker is
//! unreachable. Right after connecting, the init-time topology of the instance is
//! declared over a transient channel.

use crate::{
    builder::InstanceBuildResult,
    config::ConnectionConfig,
    errors::AmqpError,
    topology::{self, TopologyOperation},
};
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

type ConnectionCell = Arc<OnceCell<Arc<Connection>>>;

/// Store of one connection per instance name.
#[derive(Default)]
pub struct ConnectionHolder {
    connections: Mutex<HashMap<String, ConnectionCell>>,
    disposed: AtomicBool,
}

impl ConnectionHolder {
    pub fn new() -> ConnectionHolder {
        ConnectionHolder::default()
    }

    /// Returns the connection of the instance, creating it on first use.
    ///
    /// Concurrent callers for the same instance share a single creation attempt.
    /// The init operations of the instance run once, right after connecting.
    ///
    /// # Parameters
    /// * `instance` - The validated instance whose connection is wanted
    ///
    /// # Returns
    /// The shared connection, `BrokerUnreachable` once every reconnect attempt failed,
    /// or `AlreadyDisposed` when the holder is disposed before or during creation
    pub async fn get_or_create(
        &self,
        instance: &InstanceBuildResult,
    ) -> Result<Arc<Connection>, AmqpError> {
        self.ensure_not_disposed()?;

        let cell = self
            .lock()
            .entry(instance.name.clone())
            .or_default()
            .clone();

        let conn = cell
            .get_or_try_init(|| self.create_connection(instance))
            .await
            .cloned()?;

        // the cell was drained by a dispose racing with this creation
        if self.ensure_not_disposed().is_err() {
            if let Err(err) = conn.close(200, "relay shutdown").await {
                debug!(
                    error = err.to_string(),
                    instance = instance.name,
                    "connection already closed"
                );
            }
            return Err(AmqpError::AlreadyDisposed);
        }

        Ok(conn)
    }

    /// Closes every connection. Any later use of the holder fails.
    pub async fn dispose(&self) -> Result<(), AmqpError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyDisposed);
        }

        let cells: Vec<(String, ConnectionCell)> = self.lock().drain().collect();
        for (name, cell) in cells {
            if let Some(connection) = cell.get() {
                debug!(instance = name, "closing connection");
                if let Err(err) = connection.close(200, "relay shutdown").await {
                    warn!(error = err.to_string(), instance = name, "failure to close connection");
                }
            }
        }

        Ok(())
    }

    fn ensure_not_disposed(&self) -> Result<(), AmqpError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AmqpError::AlreadyDisposed);
        }

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConnectionCell>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn create_connection(
        &self,
        instance: &InstanceBuildResult,
    ) -> Result<Arc<Connection>, AmqpError> {
        let init = instance
            .init_operations
            .as_ref()
            .map(topology::init_operations)
            .unwrap_or_default();

        connect_with_retry(&instance.name, &instance.connection, || async {
            self.ensure_not_disposed()?;
            info!(
                instance = instance.name,
                config = %instance.connection,
                dispatch_concurrency = instance.dispatch_concurrency(),
                "start trying to connect"
            );

            let conn = open(instance).await?;
            if !init.is_empty() {
                if let Err(err) = initialize(&conn, &init).await {
                    let _ = conn.close(200, "init failure").await;
                    return Err(err);
                }
            }

            Ok(Arc::new(conn))
        })
        .await
    }
}

async fn open(instance: &InstanceBuildResult) -> Result<Connection, AmqpError> {
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(instance.name.clone()));

    Connection::connect_uri(instance.connection.uri(), options)
        .await
        .map_err(|err| AmqpError::BrokerUnreachable(err.to_string()))
}

async fn initialize(conn: &Connection, operations: &[TopologyOperation]) -> Result<(), AmqpError> {
    let channel = match conn.create_channel().await {
        Ok(c) => c,
        Err(err) => {
            error!(error = err.to_string(), "error to create the init channel");
            return Err(AmqpError::ChannelError);
        }
    };

    let result = topology::install(&channel, operations).await;
    if let Err(err) = channel.close(200, "init done").await {
        debug!(error = err.to_string(), "failure to close the init channel");
    }

    result
}

/// Runs `attempt` until it succeeds, retrying only while the broker is unreachable.
///
/// At most `max_reconnect_count` retries are made, `retry_timeout` apart. Any other
/// error is returned at once.
pub(crate) async fn connect_with_retry<T, F, Fut>(
    instance: &str,
    config: &ConnectionConfig,
    mut attempt: F,
) -> Result<T, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    let mut reconnect_number = 0;

    loop {
        match attempt().await {
            Ok(conn) => {
                info!(instance = instance, config = %config, "successfully connected");
                return Ok(conn);
            }
            Err(AmqpError::BrokerUnreachable(reason)) => {
                if reconnect_number >= config.max_reconnect_count {
                    error!(
                        error = reason,
                        instance = instance,
                        config = %config,
                        "failure to connect, no attempts left"
                    );
                    return Err(AmqpError::BrokerUnreachable(reason));
                }

                warn!(
                    error = reason,
                    instance = instance,
                    attempts_left = config.max_reconnect_count - reconnect_number,
                    retry_in_ms = config.retry_timeout.as_millis() as u64,
                    "failure to connect, trying again"
                );

                reconnect_number += 1;
                tokio::time::sleep(config.retry_timeout).await;
            }
            Err(err) => return Err(err),
        }
    }
}

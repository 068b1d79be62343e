// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Limited Pool
//!
//! A bounded pool of reusable resources, created on demand by a factory. It is used
//! to share publishing channels of an instance between concurrent callers.

use crate::errors::AmqpError;
use futures_util::future::BoxFuture;
use std::{
    ops::Deref,
    sync::{Arc, Mutex},
};
use tokio::sync::Semaphore;
use tracing::debug;

type Factory<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, AmqpError>> + Send + Sync>;

/// Pool holding at most `max_size` live resources.
///
/// `take` suspends until a free resource exists or another one may be created.
/// The resource goes back to the pool when its [`Pooled`] guard is dropped, including
/// when the future holding the guard is cancelled.
pub struct LimitedPool<T> {
    factory: Factory<T>,
    semaphore: Semaphore,
    free: Mutex<Vec<T>>,
    all: Mutex<Vec<T>>,
}

impl<T> LimitedPool<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an empty pool. No resource is created before the first `take`.
    ///
    /// # Parameters
    /// * `max_size` - Maximum number of live resources, at least 1
    /// * `factory` - Creates a new resource when no free one is left
    ///
    /// # Returns
    /// The pool, or `InvalidConfiguration` when `max_size` is 0
    pub fn new<F, Fut>(max_size: usize, factory: F) -> Result<LimitedPool<T>, AmqpError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, AmqpError>> + Send + 'static,
    {
        if max_size < 1 {
            return Err(AmqpError::InvalidConfiguration(
                "max pool size cannot be less than 1".to_owned(),
            ));
        }

        Ok(LimitedPool {
            factory: Box::new(move || Box::pin(factory())),
            semaphore: Semaphore::new(max_size),
            free: Mutex::new(vec![]),
            all: Mutex::new(vec![]),
        })
    }

    /// Takes a free resource, or creates one if the pool is not full yet.
    ///
    /// If the factory fails, the capacity permit is given back so that the pool
    /// does not shrink.
    ///
    /// # Returns
    /// A guard giving access to the resource until it is dropped, the factory error,
    /// or `AlreadyDisposed` once the pool is closed
    pub async fn take(&self) -> Result<Pooled<'_, T>, AmqpError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| AmqpError::AlreadyDisposed)?;

        let reused = self.lock_free().pop();
        if let Some(item) = reused {
            permit.forget();
            return Ok(Pooled { pool: self, item });
        }

        debug!("creating a new pooled resource");
        let item = (self.factory)().await?;
        permit.forget();

        self.lock_all().push(item.clone());
        Ok(Pooled { pool: self, item })
    }

    fn put_back(&self, item: T) {
        self.lock_free().push(item);
        self.semaphore.add_permits(1);
    }

    /// Every resource created by this pool, for bulk disposal at shutdown.
    pub fn created(&self) -> Vec<T> {
        self.lock_all().clone()
    }

    /// Stops admitting new takers.
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn lock_free(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_all(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.all.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared handle to a pool.
pub type SharedPool<T> = Arc<LimitedPool<T>>;

/// A resource taken from a [`LimitedPool`], returned to it on drop.
pub struct Pooled<'a, T>
where
    T: Clone + Send + 'static,
{
    pool: &'a LimitedPool<T>,
    item: T,
}

impl<T> Deref for Pooled<'_, T>
where
    T: Clone + Send + 'static,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> Drop for Pooled<'_, T>
where
    T: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.pool.put_back(self.item.clone());
    }
}

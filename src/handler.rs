// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Handlers are registered statically: each subscription is built with a factory
//! producing a strongly-typed handler, and stores a type-erased executor that decodes
//! the payload and runs a fresh handler for every delivery.

use crate::{codec, errors::HandlerError};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::{any::Any, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Payload types that can travel through the relay.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Application code processing messages of type `M`.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync {
    /// Handles one message. Returning an error routes the delivery into the
    /// subscription's dead-letter cycle, when there is one.
    async fn handle(&self, message: M, cancellation: CancellationToken) -> Result<(), HandlerError>;
}

#[async_trait]
impl<M, H> MessageHandler<M> for Arc<H>
where
    M: Send + 'static,
    H: MessageHandler<M> + ?Sized,
{
    async fn handle(
        &self,
        message: M,
        cancellation: CancellationToken,
    ) -> Result<(), HandlerError> {
        self.as_ref().handle(message, cancellation).await
    }
}

/// Type-erased execution of a delivery payload.
#[async_trait]
pub(crate) trait DeliveryExecutor: Send + Sync {
    async fn execute(&self, payload: &[u8], cancellation: CancellationToken)
        -> Result<(), HandlerError>;
}

/// Decodes into `M`, then runs a handler freshly produced by the factory.
pub(crate) struct HandlerExecutor<M, H, F> {
    factory: F,
    _marker: PhantomData<fn() -> (M, H)>,
}

impl<M, H, F> HandlerExecutor<M, H, F>
where
    M: Message,
    H: MessageHandler<M> + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    pub(crate) fn new(factory: F) -> Arc<dyn DeliveryExecutor> {
        Arc::new(HandlerExecutor {
            factory,
            _marker: PhantomData,
        })
    }
}

#[async_trait]
impl<M, H, F> DeliveryExecutor for HandlerExecutor<M, H, F>
where
    M: Message,
    H: MessageHandler<M> + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    async fn execute(
        &self,
        payload: &[u8],
        cancellation: CancellationToken,
    ) -> Result<(), HandlerError> {
        let message: M = codec::decode(payload)?;

        let handled = AssertUnwindSafe(async move {
            let handler = (self.factory)();
            handler.handle(message, cancellation).await
        })
        .catch_unwind()
        .await;

        handled.unwrap_or_else(|panic| Err(panic_message(panic).into()))
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let reason = match panic.downcast::<String>() {
        Ok(reason) => *reason,
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|reason| (*reason).to_owned())
            .unwrap_or_else(|| "unknown reason".to_owned()),
    };

    format!("handler panicked: {}", reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Ping>>,
    }

    #[async_trait]
    impl MessageHandler<Ping> for Recorder {
        async fn handle(&self, message: Ping, _: CancellationToken) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn executor_decodes_and_dispatches() {
        let recorder = Arc::new(Recorder::default());
        let shared = recorder.clone();
        let executor = HandlerExecutor::<Ping, _, _>::new(move || shared.clone());

        executor
            .execute(br#"{"seq":9}"#, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), vec![Ping { seq: 9 }]);
    }

    #[tokio::test]
    async fn executor_reports_undecodable_payload_as_failure() {
        let recorder = Arc::new(Recorder::default());
        let shared = recorder.clone();
        let executor = HandlerExecutor::<Ping, _, _>::new(move || shared.clone());

        let result = executor.execute(b"not json", CancellationToken::new()).await;

        assert!(result.is_err());
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler<Ping> for Panicking {
        async fn handle(&self, message: Ping, _: CancellationToken) -> Result<(), HandlerError> {
            panic!("cannot handle ping {}", message.seq);
        }
    }

    #[tokio::test]
    async fn handler_panic_is_reported_as_failure() {
        let executor = HandlerExecutor::<Ping, _, _>::new(|| Panicking);

        let result = executor
            .execute(br#"{"seq":3}"#, CancellationToken::new())
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "handler panicked: cannot handle ping 3");
    }

    #[tokio::test]
    async fn factory_runs_once_per_delivery() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let executor = HandlerExecutor::<Ping, _, _>::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(Recorder::default())
        });

        for _ in 0..3 {
            executor
                .execute(br#"{"seq":1}"#, CancellationToken::new())
                .await
                .unwrap();
        }

        assert_eq!(built.load(Ordering::SeqCst), 3);
    }
}

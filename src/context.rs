// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Chain
//!
//! Every consumed batch runs through an ordered chain of [`Handler`]s. Each
//! handler receives the batch plus a per-batch [`Context`] and decides when
//! to hand over to the rest of the chain by awaiting [`Context::next`], so
//! middleware can do work both before and after the inner handlers.
//!
//! A panic anywhere in the chain is caught at the [`Context::handle`]
//! boundary and turned into [`AmqpError::HandlerPanic`], which the consumer
//! treats like any other handler failure.

use crate::{errors::AmqpError, transport::Delivery};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::error;

/// One link of the handler chain.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes `batch` on behalf of consumer `idx`. Middleware calls
    /// `ctx.next(batch, idx)` to run the rest of the chain.
    async fn handle(&self, ctx: &mut Context, batch: &[Delivery], idx: u32)
        -> Result<(), AmqpError>;
}

/// Frozen, ordered handler chain shared by every batch of a consumer.
pub type HandlerChain = Arc<[Arc<dyn Handler>]>;

/// Turns a panic caught in the chain into the error of the batch.
pub type PanicHandler =
    Arc<dyn Fn(Box<dyn Any + Send>, &[Delivery], u32) -> AmqpError + Send + Sync>;

/// Per-batch state: chain cursor, key/value scratch space, trace context and
/// the worker's exit signal.
pub struct Context {
    layer: usize,
    chain: HandlerChain,
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
    trace: opentelemetry::Context,
    exit: CancellationToken,
    on_panic: Option<PanicHandler>,
}

impl Context {
    pub fn new(chain: HandlerChain, trace: opentelemetry::Context, exit: CancellationToken) -> Self {
        Context {
            layer: 0,
            chain,
            values: HashMap::new(),
            trace,
            exit,
            on_panic: None,
        }
    }

    /// Replaces the default panic logging and conversion.
    pub fn with_panic_handler(mut self, handler: PanicHandler) -> Self {
        self.on_panic = Some(handler);
        self
    }

    /// Runs the chain from its first handler, converting panics into errors.
    pub async fn handle(&mut self, batch: &[Delivery], idx: u32) -> Result<(), AmqpError> {
        let Some(first) = self.chain.first().cloned() else {
            return Ok(());
        };
        self.layer = 0;

        match AssertUnwindSafe(first.handle(self, batch, idx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => match &self.on_panic {
                Some(handler) => Err(handler(panic, batch, idx)),
                None => Err(recover_panic(panic, batch, idx)),
            },
        }
    }

    /// Calls the next handler in chain order; `Ok(())` once the chain is done.
    pub async fn next(&mut self, batch: &[Delivery], idx: u32) -> Result<(), AmqpError> {
        self.layer += 1;
        match self.chain.get(self.layer).cloned() {
            Some(handler) => handler.handle(self, batch, idx).await,
            None => Ok(()),
        }
    }

    pub fn set<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// Trace context extracted from the first delivery of the batch.
    pub fn trace_context(&self) -> &opentelemetry::Context {
        &self.trace
    }

    /// Cancelled when the consumer stops its worker (shutdown or reconnect).
    pub fn exit_signal(&self) -> &CancellationToken {
        &self.exit
    }
}

fn recover_panic(panic: Box<dyn Any + Send>, batch: &[Delivery], idx: u32) -> AmqpError {
    let reason = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    };

    let first = batch.first().cloned().unwrap_or_default();
    error!(
        consumer_id = idx,
        routing_key = first.routing_key,
        message_id = first.message_id(),
        body = String::from_utf8_lossy(&first.data).to_string(),
        error = reason,
        "delivery handlers recover"
    );

    AmqpError::HandlerPanic(reason)
}

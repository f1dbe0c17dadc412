// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Engine
//!
//! Self-healing consumers and confirmed producers on top of `lapin`.
//!
//! A [`Consumer`] pulls deliveries in batches, runs them through a chain of
//! [`Handler`]s and settles each batch with one cumulative ack or nack,
//! retrying failed batches under a [`retry::RetryPolicy`]. A [`Producer`]
//! publishes with publisher confirms and bounded retries. Both reconnect and
//! reinstall their topology on their own when the broker drops them.
//!
//! Engines are usually built through a [`Hub`], which resolves
//! configuration keys with a [`ConfigLoader`] and keeps the engines
//! addressable by key until shutdown.

mod client;
mod monitor;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod context;
pub mod errors;
pub mod exchange;
pub mod hub;
pub mod otel;
pub mod producer;
pub mod queue;
pub mod retry;
pub mod transport;

pub use channel::LapinTransport;
pub use config::{Config, ConfigLoader, StaticConfigLoader};
pub use consumer::Consumer;
pub use context::{Context, Handler};
pub use errors::{AmqpError, ErrorCode};
pub use hub::Hub;
pub use producer::Producer;
pub use transport::{Delivery, Message};

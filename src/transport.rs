// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The engines never talk to `lapin` directly. They drive a [`Session`] (one
//! connection plus one channel) obtained from a [`Transport`]. The production
//! transport lives in [`crate::channel`]; tests plug in an in-memory broker.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Content type used by [`Message::text`].
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// AMQP delivery mode of a persistent message.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// One message received by a consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl Delivery {
    pub fn message_id(&self) -> String {
        self.properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default()
    }
}

/// One message to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(data: impl Into<Vec<u8>>, properties: BasicProperties) -> Self {
        Message {
            properties,
            data: data.into(),
        }
    }

    /// A `text/plain` message stamped with a fresh message id and timestamp.
    pub fn text(data: impl Into<Vec<u8>>, persistent: bool) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(TEXT_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_timestamp(timestamp)
            .with_headers(FieldTable::default());
        if persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        Message {
            properties,
            data: data.into(),
        }
    }

    /// Sets the message priority, clamped to the 0-9 range brokers honour.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.properties = self.properties.with_priority(priority.min(9));
        self
    }

    pub fn persistent(mut self) -> Self {
        self.properties = self
            .properties
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        self
    }

    pub fn message_id(&self) -> String {
        self.properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default()
    }

    pub fn kind(&self) -> String {
        self.properties
            .kind()
            .as_ref()
            .map(|kind| kind.to_string())
            .unwrap_or_default()
    }
}

/// Broker answer to a published message in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// Resolves once the broker confirms (or rejects) a publish.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Close or cancel events raised by a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ConnectionClosed(String),
    ChannelClosed(String),
    /// The broker cancelled the consumer, e.g. the queue was deleted.
    ConsumerCancelled(String),
}

/// A freshly opened session together with its notification stream.
pub struct Connected {
    pub session: Arc<dyn Session>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

/// Opens sessions against a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dials `uri` and opens one channel on the new connection.
    async fn connect(&self, uri: &str, name: &str) -> Result<Connected, AmqpError>;
}

/// One connection plus one channel.
#[async_trait]
pub trait Session: Send + Sync {
    async fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> Result<(), AmqpError>;

    async fn queue_declare(&self, name: &str, args: FieldTable) -> Result<(), AmqpError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Registers `tag` on `queue` and returns the delivery stream.
    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, AmqpError>;

    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<PendingConfirm, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, tag: &str) -> Result<(), AmqpError>;

    /// Closes the underlying connection.
    async fn close(&self) -> Result<(), AmqpError>;
}

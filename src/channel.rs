// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! The production [`Transport`]: it establishes a `lapin` connection, opens a
//! channel on it and wires the connection/channel error callbacks into the
//! session's notification stream so the engines' monitors can react.

use crate::{
    errors::AmqpError,
    exchange::ExchangeKind,
    transport::{Confirmation, Connected, Delivery, Message, Notification, PendingConfirm, Session, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Upper bound on deliveries buffered between the broker and the worker.
const DELIVERY_BUFFER: usize = 256;

/// [`Transport`] backed by `lapin`.
#[derive(Debug, Default, Clone)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Self {
        LapinTransport
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, uri: &str, name: &str) -> Result<Connected, AmqpError> {
        debug!(name, "creating amqp connection...");
        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(name.to_owned()));

        let connection = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), name, "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!(name, "amqp connected");

        let channel = match connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), name, "error to create the channel");
                let _ = connection.close(0, "failure to create channel").await;
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;
        debug!(name, "channel created");

        let (notifier, notifications) = mpsc::unbounded_channel();

        let tx = notifier.clone();
        connection.on_error(move |err| {
            let _ = tx.send(Notification::ConnectionClosed(err.to_string()));
        });
        let tx = notifier.clone();
        channel.on_error(move |err| {
            let _ = tx.send(Notification::ChannelClosed(err.to_string()));
        });

        Ok(Connected {
            session: std::sync::Arc::new(LapinSession {
                connection,
                channel,
                notifier,
            }),
            notifications,
        })
    }
}

struct LapinSession {
    connection: Connection,
    channel: Channel,
    notifier: mpsc::UnboundedSender<Notification>,
}

#[async_trait]
impl Session for LapinSession {
    async fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn queue_declare(&self, name: &str, args: FieldTable) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                AmqpError::DeclareQueueError(name.to_owned())
            })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: true })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, AmqpError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(tag.to_owned())
            })?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let notifier = self.notifier.clone();
        let tag = tag.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            redelivered: delivery.redelivered,
                            properties: delivery.properties,
                            data: delivery.data,
                        };
                        if tx.send(delivery).await.is_err() {
                            // the session has been replaced
                            return;
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        let _ = notifier.send(Notification::ChannelClosed(err.to_string()));
                        return;
                    }
                }
            }

            warn!(tag, "delivery stream ended");
            let _ = notifier.send(Notification::ConsumerCancelled(tag));
        });

        Ok(rx)
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ConfirmSelectError(err.to_string())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<PendingConfirm, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.data,
                message.properties.clone(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                let err = AmqpError::from(err);
                if err.is_connectivity() {
                    err
                } else {
                    AmqpError::PublishingError(err.to_string())
                }
            })?;

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(confirmation) if confirmation.is_ack() => Ok(Confirmation::Ack),
                Ok(confirmation) if confirmation.is_nack() => Ok(Confirmation::Nack),
                Ok(_) => Ok(Confirmation::NotRequested),
                Err(err) => {
                    let err = AmqpError::from(err);
                    if err.is_connectivity() {
                        Err(AmqpError::ClientClosing(err.to_string()))
                    } else {
                        Err(err)
                    }
                }
            }
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn basic_cancel(&self, tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), tag, "error to cancel the consumer");
                AmqpError::CloseError(err.to_string())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connection
            .close(0, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

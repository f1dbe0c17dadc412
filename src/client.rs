// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Engine Client
//!
//! A `Client` owns the single session (connection + channel) of one consumer
//! or producer instance and knows how to install that instance's topology:
//!
//! 1. exchange (durable, not auto-deleted)
//! 2. queue (durable, not exclusive) with the configured arguments
//! 3. queue binding with the binding/routing key
//! 4. consumer: QoS from the prefetch count, then the consumer tag
//! 5. producer: publisher-confirm mode unless `no_confirm` is set
//!
//! An empty exchange name means the default exchange, which is neither
//! declared nor bound.

use crate::{
    config::{Config, Extra},
    errors::AmqpError,
    queue::queue_arguments,
    transport::{Connected, Delivery, Notification, Session, Transport},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) struct Client {
    conf: Arc<Config>,
    idx: u32,
    transport: Arc<dyn Transport>,
    session: Option<Arc<dyn Session>>,
    deliveries: Option<mpsc::Receiver<Delivery>>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl Client {
    /// Connects and installs the topology; nothing is kept on failure.
    pub(crate) async fn new(
        conf: Arc<Config>,
        idx: u32,
        transport: Arc<dyn Transport>,
    ) -> Result<Client, AmqpError> {
        let mut client = Client {
            conf,
            idx,
            transport,
            session: None,
            deliveries: None,
            notifications: None,
        };
        client.init().await?;
        Ok(client)
    }

    async fn init(&mut self) -> Result<(), AmqpError> {
        let Connected {
            session,
            notifications,
        } = self
            .transport
            .connect(&self.conf.uri(), &self.connection_name())
            .await?;

        match self.install(session.as_ref()).await {
            Ok(deliveries) => {
                self.session = Some(session);
                self.deliveries = deliveries;
                self.notifications = Some(notifications);
                Ok(())
            }
            Err(err) => {
                if let Err(close_err) = session.close().await {
                    debug!(
                        key = self.conf.key,
                        id = self.idx,
                        error = close_err.to_string(),
                        "failure to close half-open session"
                    );
                }
                Err(err)
            }
        }
    }

    async fn install(
        &self,
        session: &dyn Session,
    ) -> Result<Option<mpsc::Receiver<Delivery>>, AmqpError> {
        match &self.conf.extra {
            Extra::Consumer(conf) => {
                if !conf.exchange.is_empty() {
                    debug!(exchange = conf.exchange, "creating exchange");
                    session
                        .exchange_declare(&conf.exchange, conf.exchange_type)
                        .await?;
                }

                debug!(queue = conf.queue, "creating queue");
                session
                    .queue_declare(&conf.queue, queue_arguments(&conf.queue_args))
                    .await?;

                if !conf.exchange.is_empty() {
                    debug!(
                        "binding queue: {} to the exchange: {} with the key: {}",
                        conf.queue, conf.exchange, conf.binding_key
                    );
                    session
                        .queue_bind(&conf.queue, &conf.exchange, &conf.binding_key)
                        .await?;
                }

                session.basic_qos(conf.prefetch_count as u16).await?;
                let deliveries = session.basic_consume(&conf.queue, &conf.consumer).await?;
                Ok(Some(deliveries))
            }
            Extra::Producer(conf) => {
                if !conf.exchange.is_empty() {
                    debug!(exchange = conf.exchange, "creating exchange");
                    session
                        .exchange_declare(&conf.exchange, conf.exchange_type)
                        .await?;
                }

                debug!(queue = conf.queue, "creating queue");
                session
                    .queue_declare(&conf.queue, queue_arguments(&conf.queue_args))
                    .await?;

                if !conf.exchange.is_empty() {
                    debug!(
                        "binding queue: {} to the exchange: {} with the key: {}",
                        conf.queue, conf.exchange, conf.routing_key
                    );
                    session
                        .queue_bind(&conf.queue, &conf.exchange, &conf.routing_key)
                        .await?;
                }

                if !conf.no_confirm {
                    session.confirm_select().await?;
                }
                Ok(None)
            }
        }
    }

    /// Drops the current session and rebuilds connection, channel and topology.
    pub(crate) async fn recover(&mut self) -> Result<(), AmqpError> {
        info!(key = self.conf.key, id = self.idx, "recover now");
        self.teardown().await;
        self.init().await
    }

    async fn teardown(&mut self) {
        self.deliveries = None;
        self.notifications = None;
        if let Some(session) = self.session.take() {
            if let Err(err) = session.close().await {
                debug!(
                    key = self.conf.key,
                    id = self.idx,
                    error = err.to_string(),
                    "previous session already closed"
                );
            }
        }
    }

    /// Cancels the consumer tag (consumers only), then closes the connection.
    ///
    /// The session is released even when the broker calls fail; the first
    /// failure is reported.
    pub(crate) async fn close(&mut self) -> Result<(), AmqpError> {
        self.deliveries = None;
        self.notifications = None;
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        let mut first_err = None;
        if let Extra::Consumer(conf) = &self.conf.extra {
            if let Err(err) = session.basic_cancel(&conf.consumer).await {
                warn!(
                    key = self.conf.key,
                    id = self.idx,
                    error = err.to_string(),
                    "close channel fail"
                );
                first_err = Some(err);
            }
        }

        if let Err(err) = session.close().await {
            warn!(
                key = self.conf.key,
                id = self.idx,
                error = err.to_string(),
                "close connection fail"
            );
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(AmqpError::CloseError(err.to_string())),
            None => Ok(()),
        }
    }

    pub(crate) fn session(&self) -> Option<Arc<dyn Session>> {
        self.session.clone()
    }

    pub(crate) fn take_deliveries(&mut self) -> Option<mpsc::Receiver<Delivery>> {
        self.deliveries.take()
    }

    /// Returns a stream handed out by `take_deliveries` unless it was
    /// replaced by a recovery in the meantime.
    pub(crate) fn restore_deliveries(&mut self, deliveries: mpsc::Receiver<Delivery>) {
        if self.deliveries.is_none() && self.session.is_some() {
            self.deliveries = Some(deliveries);
        }
    }

    pub(crate) fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.take()
    }

    fn connection_name(&self) -> String {
        format!("{}-{}", self.conf.key, self.idx)
    }
}

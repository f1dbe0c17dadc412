// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Engine Hub
//!
//! The [`Hub`] turns configuration keys into live engines and keeps them
//! addressable by key: a consumer key maps to its group of
//! `consumer_count` consumers, a producer key to its single producer.
//! Shutdown fans out concurrently; keys whose engines all closed are
//! removed, the others stay registered so the close can be retried.

use crate::{
    channel::LapinTransport,
    config::{ConfigLoader, Kind},
    consumer::Consumer,
    errors::AmqpError,
    otel::{CONSUMER_MODULE, PRODUCER_MODULE},
    producer::Producer,
    transport::Transport,
};
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::{join, join_all};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Registry of the consumers and producers built from configuration keys.
pub struct Hub {
    transport: Arc<dyn Transport>,
    loader: Arc<dyn ConfigLoader>,
    consumers: DashMap<String, Vec<Consumer>>,
    producers: DashMap<String, Producer>,
}

impl Hub {
    pub fn new(transport: Arc<dyn Transport>, loader: Arc<dyn ConfigLoader>) -> Self {
        Hub {
            transport,
            loader,
            consumers: DashMap::new(),
            producers: DashMap::new(),
        }
    }

    /// A hub connecting through `lapin`.
    pub fn with_loader(loader: Arc<dyn ConfigLoader>) -> Self {
        Self::new(Arc::new(LapinTransport::new()), loader)
    }

    /// Loads every key from `namespace` and starts its engines.
    ///
    /// Keys already registered are skipped. Stops at the first key that
    /// fails; keys initialised before it stay registered.
    pub async fn init<S>(&self, keys: &[S], namespace: &str) -> Result<(), AmqpError>
    where
        S: AsRef<str>,
    {
        for key in keys {
            self.init_key(key.as_ref(), namespace).await?;
        }
        Ok(())
    }

    async fn init_key(&self, key: &str, namespace: &str) -> Result<(), AmqpError> {
        if self.consumers.contains_key(key) || self.producers.contains_key(key) {
            debug!(key, "already initialized, skipping");
            return Ok(());
        }

        let conf = Arc::new(self.loader.load(key, namespace).await?);
        match conf.kind {
            Kind::Consumer => {
                let count = conf.consumer().map(|c| c.consumer_count).unwrap_or(1);
                let mut group = Vec::with_capacity(count);
                for idx in 0..count {
                    match Consumer::new(conf.clone(), idx as u32, self.transport.clone()).await {
                        Ok(consumer) => group.push(consumer),
                        Err(err) => {
                            close_consumers(key, &group).await.ok();
                            return Err(err);
                        }
                    }
                }

                let raced = match self.consumers.entry(key.to_owned()) {
                    Entry::Occupied(_) => Some(group),
                    Entry::Vacant(entry) => {
                        entry.insert(group);
                        None
                    }
                };
                if let Some(group) = raced {
                    warn!(key, "registered concurrently, closing the duplicate consumers");
                    close_consumers(key, &group).await.ok();
                }
            }
            Kind::Producer => {
                let producer = Producer::new(conf.clone(), 0, self.transport.clone()).await?;

                let raced = match self.producers.entry(key.to_owned()) {
                    Entry::Occupied(_) => Some(producer),
                    Entry::Vacant(entry) => {
                        entry.insert(producer);
                        None
                    }
                };
                if let Some(producer) = raced {
                    warn!(key, "registered concurrently, closing the duplicate producer");
                    close_producer(key, &producer).await.ok();
                }
            }
        }

        info!(key, namespace, "rabbitmq engines initialized");
        Ok(())
    }

    /// The consumer group registered under `key`.
    pub fn consumers(&self, key: &str) -> Result<Vec<Consumer>, AmqpError> {
        self.consumers
            .get(key)
            .map(|group| group.value().clone())
            .ok_or_else(|| AmqpError::NotFound(format!("[{}][{}]", CONSUMER_MODULE, key)))
    }

    pub fn producer(&self, key: &str) -> Result<Producer, AmqpError> {
        self.producers
            .get(key)
            .map(|producer| producer.value().clone())
            .ok_or_else(|| AmqpError::NotFound(format!("[{}][{}]", PRODUCER_MODULE, key)))
    }

    /// Closes every consumer of `key` concurrently.
    pub async fn close_consumer(&self, key: &str) -> Result<(), AmqpError> {
        let group = self.consumers(key)?;
        close_consumers(key, &group).await?;
        self.consumers.remove(key);
        Ok(())
    }

    pub async fn close_producer(&self, key: &str) -> Result<(), AmqpError> {
        let producer = self.producer(key)?;
        close_producer(key, &producer).await?;
        self.producers.remove(key);
        Ok(())
    }

    /// Closes every registered engine concurrently and reports the first
    /// failure.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let groups: Vec<(String, Vec<Consumer>)> = self
            .consumers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let producers: Vec<(String, Producer)> = self
            .producers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let consumers_closed = join_all(groups.iter().map(|(key, group)| async move {
            (key, close_consumers(key, group).await)
        }));
        let producers_closed = join_all(producers.iter().map(|(key, producer)| async move {
            (key, close_producer(key, producer).await)
        }));
        let (consumers_closed, producers_closed) = join(consumers_closed, producers_closed).await;

        let mut first_err = None;
        for (key, res) in consumers_closed {
            match res {
                Ok(()) => {
                    self.consumers.remove(key.as_str());
                }
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        for (key, res) in producers_closed {
            match res {
                Ok(()) => {
                    self.producers.remove(key.as_str());
                }
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// An engine closed earlier counts as closed.
fn already_closed(res: Result<(), AmqpError>) -> Result<(), AmqpError> {
    match res {
        Err(AmqpError::AlreadyClosed(_)) => Ok(()),
        other => other,
    }
}

async fn close_consumers(key: &str, group: &[Consumer]) -> Result<(), AmqpError> {
    let results = join_all(group.iter().map(|consumer| consumer.close())).await;

    let mut first_err = None;
    for (consumer, res) in group.iter().zip(results) {
        if let Err(err) = already_closed(res) {
            error!(
                key,
                id = consumer.id(),
                error = err.to_string(),
                "[{}] close fail",
                CONSUMER_MODULE
            );
            first_err.get_or_insert(err);
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn close_producer(key: &str, producer: &Producer) -> Result<(), AmqpError> {
    already_closed(producer.close().await).inspect_err(|err| {
        error!(
            key,
            id = producer.id(),
            error = err.to_string(),
            "[{}] close fail",
            PRODUCER_MODULE
        )
    })
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Engine Configuration
//!
//! A [`Config`] describes one broker endpoint plus either a consumer or a
//! producer topology. Configs are resolved by key through a [`ConfigLoader`],
//! validated once, and shared immutably (`Arc<Config>`) by every instance
//! built from them.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::debug;

/// Queue argument that the broker only accepts as an integer.
pub const QUEUE_ARG_MESSAGE_TTL: &str = "x-message-ttl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Consumer,
    Producer,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Consumer tag; generated from the key when empty.
    #[serde(default)]
    pub consumer: String,
    pub exchange: String,
    #[serde(default)]
    pub exchange_type: ExchangeKind,
    #[serde(default)]
    pub binding_key: String,
    #[serde(default)]
    pub prefetch_count: u32,
    #[serde(default)]
    pub consumer_count: usize,
    #[serde(default)]
    pub queue_args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProducerConfig {
    pub queue: String,
    pub exchange: String,
    #[serde(default)]
    pub exchange_type: ExchangeKind,
    #[serde(default)]
    pub routing_key: String,
    /// Publish every message with delivery mode 2.
    #[serde(default)]
    pub persistent: bool,
    /// Skip publisher confirms entirely.
    #[serde(default)]
    pub no_confirm: bool,
    #[serde(default)]
    pub queue_args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extra {
    Consumer(ConsumerConfig),
    Producer(ProducerConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub url: String,
    pub vhost: String,
    pub kind: Kind,
    pub extra: Extra,
    pub key: String,
}

#[derive(Deserialize)]
struct RawConfig {
    url: String,
    #[serde(default)]
    vhost: String,
    kind: Kind,
    #[serde(default)]
    extra: Value,
}

impl Config {
    /// Builds and validates a config from its JSON document.
    pub fn from_value(key: &str, value: Value) -> Result<Config, AmqpError> {
        let raw: RawConfig = serde_json::from_value(value).map_err(|err| {
            AmqpError::ConfigError(format!("{}failed to unmarshal config: {}", log_prefix(key), err))
        })?;

        let extra = match raw.kind {
            Kind::Consumer => {
                let mut consumer: ConsumerConfig =
                    serde_json::from_value(raw.extra).map_err(|err| {
                        AmqpError::ConfigError(format!(
                            "{}failed to unmarshal consumer config: {}",
                            log_prefix(key),
                            err
                        ))
                    })?;
                normalize_consumer(key, &mut consumer)?;
                Extra::Consumer(consumer)
            }
            Kind::Producer => {
                let mut producer: ProducerConfig =
                    serde_json::from_value(raw.extra).map_err(|err| {
                        AmqpError::ConfigError(format!(
                            "{}failed to unmarshal producer config: {}",
                            log_prefix(key),
                            err
                        ))
                    })?;
                normalize_producer(key, &mut producer)?;
                Extra::Producer(producer)
            }
        };

        debug!(key, "rabbitmq config loaded");

        Ok(Config {
            url: raw.url,
            vhost: raw.vhost,
            kind: raw.kind,
            extra,
            key: key.to_owned(),
        })
    }

    /// Broker URI: the url with the vhost appended.
    pub fn uri(&self) -> String {
        if self.vhost.is_empty() {
            return self.url.clone();
        }
        if self.url.ends_with('/') {
            format!("{}{}", self.url, self.vhost)
        } else {
            format!("{}/{}", self.url, self.vhost)
        }
    }

    pub fn consumer(&self) -> Option<&ConsumerConfig> {
        match &self.extra {
            Extra::Consumer(c) => Some(c),
            _ => None,
        }
    }

    pub fn producer(&self) -> Option<&ProducerConfig> {
        match &self.extra {
            Extra::Producer(p) => Some(p),
            _ => None,
        }
    }
}

fn normalize_consumer(key: &str, consumer: &mut ConsumerConfig) -> Result<(), AmqpError> {
    if consumer.queue.is_empty() {
        return Err(AmqpError::ConfigError(format!(
            "{}'queue name' cannot be empty",
            log_prefix(key)
        )));
    }
    if consumer.prefetch_count > u16::MAX as u32 {
        return Err(AmqpError::ConfigError(format!(
            "{}prefetch count {} exceeds {}",
            log_prefix(key),
            consumer.prefetch_count,
            u16::MAX
        )));
    }
    if consumer.consumer_count == 0 {
        consumer.consumer_count = 1;
    }
    if consumer.consumer.is_empty() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        consumer.consumer = format!("{}_{}", key, nanos);
    }
    coerce_message_ttl(key, &mut consumer.queue_args)
}

fn normalize_producer(key: &str, producer: &mut ProducerConfig) -> Result<(), AmqpError> {
    if producer.queue.is_empty() {
        return Err(AmqpError::ConfigError(format!(
            "{}'queue name' cannot be empty",
            log_prefix(key)
        )));
    }
    coerce_message_ttl(key, &mut producer.queue_args)
}

fn coerce_message_ttl(key: &str, args: &mut Map<String, Value>) -> Result<(), AmqpError> {
    let Some(value) = args.get_mut(QUEUE_ARG_MESSAGE_TTL) else {
        return Ok(());
    };

    let ttl = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    match ttl {
        Some(ttl) => {
            *value = Value::from(ttl);
            Ok(())
        }
        None => Err(AmqpError::ConfigError(format!(
            "{}`{}` must be an integer",
            log_prefix(key),
            QUEUE_ARG_MESSAGE_TTL
        ))),
    }
}

fn log_prefix(key: &str) -> String {
    format!("[rabbitmq][{}] ", key)
}

/// Resolves a configuration key to a validated [`Config`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn load(&self, key: &str, namespace: &str) -> Result<Config, AmqpError>;
}

/// A [`ConfigLoader`] over in-memory JSON documents, one per namespace.
///
/// Keys are dotted paths into the document, e.g. `RabbitMQ.PublishSMS`.
#[derive(Debug, Default, Clone)]
pub struct StaticConfigLoader {
    namespaces: HashMap<String, Value>,
}

impl StaticConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: &str, document: Value) -> Self {
        self.namespaces.insert(namespace.to_owned(), document);
        self
    }

    pub fn with_json(self, namespace: &str, json: &str) -> Result<Self, AmqpError> {
        let document = serde_json::from_str(json)
            .map_err(|err| AmqpError::ConfigError(format!("invalid json document: {}", err)))?;
        Ok(self.with_namespace(namespace, document))
    }
}

#[async_trait]
impl ConfigLoader for StaticConfigLoader {
    async fn load(&self, key: &str, namespace: &str) -> Result<Config, AmqpError> {
        let document = self.namespaces.get(namespace).ok_or_else(|| {
            AmqpError::NotFound(format!("{}namespace `{}`", log_prefix(key), namespace))
        })?;

        let value = key
            .split('.')
            .try_fold(document, |node, segment| node.get(segment))
            .ok_or_else(|| AmqpError::NotFound(format!("{}config", log_prefix(key))))?;

        Config::from_value(key, value.clone())
    }
}

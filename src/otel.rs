// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in AMQP message headers: the producer injects the
//! current context into every published message and the consumer extracts it
//! from the first delivery of each batch. One span is recorded per publish
//! call and one per consumed batch, carrying message ids, cost and outcome.

use crate::{
    errors::AmqpError,
    transport::{Delivery, Message},
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, Tracer},
    Context, KeyValue,
};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    time::{Duration, SystemTime},
};
use tracing::error;

pub const PRODUCER_MODULE: &str = "rabbitmq-producer";
pub const CONSUMER_MODULE: &str = "rabbitmq-consumer";

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Extracts the trace context carried by a delivery's headers.
pub fn extract_context(props: &BasicProperties) -> Context {
    let mut headers = props
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    })
}

/// Returns `props` with the current trace context merged into its headers.
pub fn inject_context(props: BasicProperties) -> BasicProperties {
    let mut headers = props
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            &Context::current(),
            &mut RabbitMQTracePropagator::new(&mut headers),
        )
    });

    props.with_headers(FieldTable::from(headers))
}

/// Records the span of one publish call.
pub fn trace_publish(message: &Message, cost: Duration, err: Option<&AmqpError>) {
    let tracer = global::tracer(PRODUCER_MODULE);
    let mut span = tracer
        .span_builder(Cow::from(PRODUCER_MODULE))
        .with_kind(SpanKind::Producer)
        .with_start_time(SystemTime::now() - cost)
        .with_attributes(vec![
            KeyValue::new("messaging.message.id", message.message_id()),
            KeyValue::new("messaging.message.type", message.kind()),
            KeyValue::new("cost_ms", cost.as_millis() as i64),
        ])
        .start(&tracer);

    finish(&mut span, err);
}

/// Records the span of one consumed batch under the context `parent`.
pub fn trace_batch(
    parent: &Context,
    batch: &[Delivery],
    consumer_id: u32,
    cost: Duration,
    err: Option<&AmqpError>,
) {
    let ids = batch
        .iter()
        .map(|d| d.message_id())
        .collect::<Vec<_>>()
        .join(",");

    let tracer = global::tracer(CONSUMER_MODULE);
    let mut span = tracer
        .span_builder(Cow::from(CONSUMER_MODULE))
        .with_kind(SpanKind::Consumer)
        .with_start_time(SystemTime::now() - cost)
        .with_attributes(vec![
            KeyValue::new("messaging.message.ids", ids),
            KeyValue::new("messaging.batch.message_count", batch.len() as i64),
            KeyValue::new("consumer_id", consumer_id as i64),
            KeyValue::new("cost_ms", cost.as_millis() as i64),
        ])
        .start_with_context(&tracer, parent);

    finish(&mut span, err);
}

fn finish<S: Span>(span: &mut S, err: Option<&AmqpError>) {
    match err {
        Some(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
        None => span.set_status(Status::Ok),
    }
    span.end();
}

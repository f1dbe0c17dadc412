// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Arguments
//!
//! Queue arguments arrive as JSON (`x-message-ttl`, `x-max-length`,
//! `x-dead-letter-exchange`, ...) and must be handed to the broker as an AMQP
//! field table.

use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Converts JSON queue arguments into an AMQP field table.
pub fn queue_arguments(args: &Map<String, Value>) -> FieldTable {
    let mut table = BTreeMap::new();
    for (key, value) in args {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    FieldTable::from(table)
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => AMQPValue::FieldTable(queue_arguments(map)),
    }
}

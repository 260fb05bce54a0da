// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Publish Options
//!
//! This module turns caller-facing publish options into the AMQP publish flags and
//! message properties, propagating the OpenTelemetry context in the headers.

use crate::otel::HeaderCarrier;
use lapin::{
    options::BasicPublishOptions,
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::{global, Context};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode asking the broker to persist the message
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Typed value of a custom message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
}

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> AMQPValue {
        match value.clone() {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// Options of a single publish.
///
/// A random message id is generated when none is given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub(crate) content_type: Option<String>,
    pub(crate) msg_type: Option<String>,
    pub(crate) message_id: Option<String>,
    pub(crate) expiration: Option<String>,
    pub(crate) persistent: bool,
    pub(crate) mandatory: bool,
    pub(crate) headers: HashMap<String, HeaderValue>,
}

impl PublishOptions {
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Sets the AMQP `type` property, used as the consumer span name.
    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    /// Per-message TTL in milliseconds.
    pub fn expiration(mut self, millis: u64) -> Self {
        self.expiration = Some(millis.to_string());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Asks the broker to return the message when no queue is bound for its key.
    ///
    /// A returned message fails the publish with `PublishError`.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Builds the publish flags and the message properties.
    pub(crate) fn build(&self, ctx: &Context) -> (BasicPublishOptions, BasicProperties) {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut HeaderCarrier::new(&mut btree))
        });

        for (key, value) in &self.headers {
            btree.insert(ShortString::from(key.clone()), AMQPValue::from(value));
        }

        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(message_id))
            .with_headers(FieldTable::from(btree));

        if let Some(content_type) = &self.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.clone()));
        }

        if let Some(msg_type) = &self.msg_type {
            properties = properties.with_type(ShortString::from(msg_type.clone()));
        }

        if let Some(expiration) = &self.expiration {
            properties = properties.with_expiration(ShortString::from(expiration.clone()));
        }

        if self.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        let options = BasicPublishOptions {
            mandatory: self.mandatory,
            immediate: false,
        };

        (options, properties)
    }
}

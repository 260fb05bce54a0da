// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declaration Options
//!
//! This module provides the options used when declaring queues through the
//! `ConnectionManager`, and the description of a queue the broker declared.

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongInt, ShortString},
};
use std::collections::BTreeMap;

/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Options of a queue declaration.
///
/// This struct implements the builder pattern. All flags default to false and no
/// optional argument is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
}

impl QueueOptions {
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: self.no_wait,
        }
    }

    /// The `x-` arguments sent along with the declaration.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        FieldTable::from(args)
    }
}

/// A queue as reported by the broker after declaration.
///
/// For server-named queues `name` is the generated name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

impl DeclaredQueue {
    pub fn new(name: &str, message_count: u32, consumer_count: u32) -> DeclaredQueue {
        DeclaredQueue {
            name: name.to_owned(),
            message_count,
            consumer_count,
        }
    }
}

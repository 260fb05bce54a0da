// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod test_helpers;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod schema;
pub mod topic;

pub use config::{ConnectionConfig, RetryPolicy};
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{Message, MessageHandler, SubscribeOptions, Subscription};
pub use errors::AmqpError;
pub use exchange::{ExchangeDescriptor, ExchangeKind, ExchangeManager, ExchangeOptions};
pub use publisher::{HeaderValue, PublishOptions};
pub use queue::{DeclaredQueue, QueueOptions};
pub use schema::{FillToken, SchemaField, TopicSchema};
pub use topic::TopicRouter;

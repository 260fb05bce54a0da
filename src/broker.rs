// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Capabilities
//!
//! The connection, exchange and topic layers never talk to `lapin` directly. They
//! go through the traits below, which expose exactly the broker capabilities those
//! layers need. `crate::channel` implements them on top of `lapin`; tests
//! substitute mocks or an in-memory broker.

use crate::{
    consumer::{Message, SubscribeOptions},
    errors::AmqpError,
    exchange::ExchangeDescriptor,
    queue::{DeclaredQueue, QueueOptions},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{options::BasicPublishOptions, types::FieldTable, BasicProperties};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Asynchronous notification emitted by a connection or a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The handle reported an error. Informational only.
    Error(String),
    /// The handle was closed, by either side.
    Closed,
}

/// Callback receiving the notifications of one handle.
pub type EventSink = Arc<dyn Fn(BrokerEvent) + Send + Sync>;

/// A message delivered by the broker together with the means to settle it.
///
/// `acker` is `None` when the consumer was registered in no-ack mode.
pub struct Delivery {
    pub message: Message,
    pub acker: Option<Arc<dyn Acknowledger>>,
}

/// Stream of deliveries of one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Settles a single delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Entry point of a broker client: opens connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a connection to `uri`.
    ///
    /// Implementations must report a refused TCP connection as
    /// `AmqpError::ConnectionError { refused: true, .. }`.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// An open connection to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a channel in publisher-confirm mode.
    async fn create_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Registers the notification callback, replacing any previous one.
    fn watch(&self, sink: EventSink);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A confirm-mode channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares an exchange.
    ///
    /// A name clash with an exchange of another type must be reported as
    /// `AmqpError::ExchangeTypeConflictError`.
    async fn assert_exchange(&self, descriptor: &ExchangeDescriptor) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    /// Declares a queue; an empty name asks the broker to generate one.
    async fn assert_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<DeclaredQueue, AmqpError>;

    /// Deletes a queue and returns the number of messages it held.
    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError>;

    /// Publishes a message and waits for the broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Registers a consumer; returns once the broker acknowledged it.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &SubscribeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Registers the notification callback, replacing any previous one.
    fn watch(&self, sink: EventSink);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Topic Routing
//!
//! This module provides the error taxonomy shared by the connection, exchange and
//! topic layers. Precondition and schema errors describe caller misuse and are never
//! retried; connection refusals are retried by `connect_with_retry`; everything else
//! is surfaced to the immediate caller.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Payloads are plain strings so the enum stays comparable in tests and cheap to
/// clone across the connection and exchange layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection or a channel to the RabbitMQ server.
    ///
    /// `refused` is set when the server actively refused the TCP connection, the only
    /// failure `connect_with_retry` retries.
    #[error("failure to connect: {reason}")]
    ConnectionError { refused: bool, reason: String },

    /// Transport failure on an established channel
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// An operation needing an active channel ran before one was opened
    #[error("this requires an active channel")]
    ChannelRequiredError,

    /// An operation needing an active connection ran before one was opened
    #[error("this requires an active connection")]
    ConnectionRequiredError,

    /// The requested exchange type is not one of topic, direct, fanout or headers
    #[error("invalid exchange type `{0}`")]
    InvalidExchangeTypeError(String),

    /// The broker already holds an exchange with this name but a different type
    #[error("exchange `{exchange}` already exists with a different type: {reason}")]
    ExchangeTypeConflictError { exchange: String, reason: String },

    /// A binding was attempted without an active exchange
    #[error("this requires an active exchange")]
    ExchangeRequiredError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error deleting an exchange with the given name
    #[error("failure to delete the exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting a queue with the given name
    #[error("failure to delete the queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// The broker negatively acknowledged or returned a published message
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error while closing a channel or a connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// An attribute key or value is not part of the topic schema
    #[error("schema violation: {0}")]
    SchemaViolationError(String),

    /// The topic schema definition itself is malformed
    #[error("invalid schema: {0}")]
    InvalidSchemaError(String),

    /// Error loading the connection configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),
}

impl AmqpError {
    /// Returns true for connection failures caused by the server refusing the connection.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, AmqpError::ConnectionError { refused: true, .. })
    }
}
